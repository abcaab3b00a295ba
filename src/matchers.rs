//! Label matchers and the selector syntax used by the migrate and export
//! commands and by the bundled selector query engine.
//!
//! Selector grammar: `metric{name=\"v\", other!=\"v\", re=~\"x.*\", nre!~\"y\"}`
//! where the metric name and the brace block are each optional (but not both
//! absent).

use crate::error::{ForgeError, Result};
use crate::types::{Labels, METRIC_NAME};
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag},
    character::complete::{char, multispace0, satisfy},
    combinator::{map, opt, recognize, value},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use regex::Regex;

/// Matcher comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regexp,
    NotRegexp,
}

impl std::fmt::Display for MatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regexp => "=~",
            MatchOp::NotRegexp => "!~",
        };
        f.write_str(s)
    }
}

/// A single label predicate. Regex matchers are anchored to the full value,
/// matching the upstream selector semantics.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    regex: Option<Regex>,
}

impl Matcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        let regex = match op {
            MatchOp::Regexp | MatchOp::NotRegexp => {
                let anchored = format!("^(?:{})$", value);
                Some(Regex::new(&anchored).map_err(|e| {
                    ForgeError::Parse(format!("invalid matcher regex {:?}: {}", value, e))
                })?)
            }
            _ => None,
        };
        Ok(Matcher {
            name,
            op,
            value,
            regex,
        })
    }

    /// True iff the matcher accepts a label with value `v`. An absent label
    /// is matched as the empty string.
    pub fn matches(&self, v: &str) -> bool {
        match self.op {
            MatchOp::Equal => v == self.value,
            MatchOp::NotEqual => v != self.value,
            MatchOp::Regexp => self.regex.as_ref().map(|r| r.is_match(v)).unwrap_or(false),
            MatchOp::NotRegexp => self.regex.as_ref().map(|r| !r.is_match(v)).unwrap_or(true),
        }
    }
}

impl std::fmt::Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// True iff a series label set satisfies every matcher in the set.
pub fn matches_labels(matchers: &[Matcher], labels: &Labels) -> bool {
    matchers
        .iter()
        .all(|m| m.matches(labels.get(&m.name).unwrap_or("")))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_' || c == ':'),
        many0(satisfy(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')),
    ))(input)
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                is_not("\\\""),
                '\\',
                alt((
                    value('\\', char('\\')),
                    value('"', char('"')),
                    value('\n', char('n')),
                    value('\t', char('t')),
                )),
            )),
            |s| s.unwrap_or_default(),
        ),
        char('"'),
    )(input)
}

fn match_op(input: &str) -> IResult<&str, MatchOp> {
    alt((
        value(MatchOp::Regexp, tag("=~")),
        value(MatchOp::NotRegexp, tag("!~")),
        value(MatchOp::NotEqual, tag("!=")),
        value(MatchOp::Equal, tag("=")),
    ))(input)
}

fn label_matcher(input: &str) -> IResult<&str, (String, MatchOp, String)> {
    map(
        tuple((
            delimited(multispace0, identifier, multispace0),
            match_op,
            delimited(multispace0, quoted_string, multispace0),
        )),
        |(name, op, val)| (name.to_string(), op, val),
    )(input)
}

fn matcher_block(input: &str) -> IResult<&str, Vec<(String, MatchOp, String)>> {
    delimited(
        char('{'),
        map(
            pair(
                separated_list0(char(','), label_matcher),
                opt(preceded(multispace0, char(','))),
            ),
            |(list, _trailing)| list,
        ),
        preceded(multispace0, char('}')),
    )(input)
}

/// Parses a series selector into a matcher set.
pub fn parse_selector(input: &str) -> Result<Vec<Matcher>> {
    let trimmed = input.trim();
    let parsed: IResult<&str, (Option<&str>, Option<Vec<(String, MatchOp, String)>>)> =
        pair(opt(identifier), opt(matcher_block))(trimmed);
    match parsed {
        Ok((rest, (name, block))) if rest.trim().is_empty() => {
            let mut matchers = Vec::new();
            if let Some(name) = name {
                matchers.push(Matcher::new(MatchOp::Equal, METRIC_NAME, name)?);
            }
            for (label, op, val) in block.into_iter().flatten() {
                matchers.push(Matcher::new(op, label, val)?);
            }
            if matchers.is_empty() {
                return Err(ForgeError::Parse(format!(
                    "selector {:?} matches nothing",
                    input
                )));
            }
            Ok(matchers)
        }
        Ok((rest, _)) => Err(ForgeError::Parse(format!(
            "unexpected input in selector after {:?}: {:?}",
            &trimmed[..trimmed.len() - rest.len()],
            rest
        ))),
        Err(e) => Err(ForgeError::Parse(format!(
            "failed to parse selector {:?}: {}",
            input, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Labels;

    #[test]
    fn test_parse_bare_metric() {
        let matchers = parse_selector("node_cpu_seconds_total").unwrap();
        assert_eq!(matchers.len(), 1);
        assert_eq!(matchers[0].name, METRIC_NAME);
        assert_eq!(matchers[0].op, MatchOp::Equal);
        assert_eq!(matchers[0].value, "node_cpu_seconds_total");
    }

    #[test]
    fn test_parse_full_selector() {
        let matchers =
            parse_selector("up{job=\"node\", instance!=\"a\", mode=~\"idle|user\"}").unwrap();
        assert_eq!(matchers.len(), 4);
        assert_eq!(matchers[1].op, MatchOp::Equal);
        assert_eq!(matchers[2].op, MatchOp::NotEqual);
        assert_eq!(matchers[3].op, MatchOp::Regexp);
    }

    #[test]
    fn test_parse_braces_only() {
        let matchers = parse_selector("{__name__=~\"node_.*\"}").unwrap();
        assert_eq!(matchers.len(), 1);
        assert!(matchers[0].matches("node_load1"));
        assert!(!matchers[0].matches("up"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_selector("").is_err());
        assert!(parse_selector("up{job=").is_err());
        assert!(parse_selector("up{} extra").is_err());
    }

    #[test]
    fn test_regex_is_fully_anchored() {
        let m = Matcher::new(MatchOp::Regexp, "job", "node").unwrap();
        assert!(m.matches("node"));
        assert!(!m.matches("node_exporter"));
    }

    #[test]
    fn test_matches_labels_missing_label_is_empty() {
        let labels = Labels::from_pairs([(METRIC_NAME, "up"), ("job", "node")]);
        let present = parse_selector("up{job=\"node\"}").unwrap();
        assert!(matches_labels(&present, &labels));

        let absent_ne = parse_selector("up{env!=\"prod\"}").unwrap();
        assert!(matches_labels(&absent_ne, &labels), "missing label is \"\"");

        let absent_eq = parse_selector("up{env=\"prod\"}").unwrap();
        assert!(!matches_labels(&absent_eq, &labels));
    }

    #[test]
    fn test_escaped_quotes_in_value() {
        let matchers = parse_selector(r#"up{msg="say \"hi\""}"#).unwrap();
        assert_eq!(matchers[1].value, "say \"hi\"");
    }
}
