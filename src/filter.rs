//! Admission filters evaluated against decoded requests.
//!
//! A filter chain decides whether a request is served at all. Chains are
//! attached globally (every request) and per subnet (requests resolved
//! to that subnet). Filters are stateless predicates over a
//! [`DhcpMessage`] and safe to evaluate from any number of tasks.
//!
//! The variant set is closed, so evaluation is a single exhaustive
//! match instead of a trait-object graph.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::options;
use crate::packet::DhcpMessage;

/// String comparison mode for [`RequestFilter::string_option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatchMode {
    /// Literal byte-for-byte comparison.
    Exact,
    /// Case-folded comparison.
    CaseInsensitive,
    /// Full-string regular expression match.
    Regex,
}

/// Numeric comparison operator for [`RequestFilter::num_option`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl NumOperator {
    fn apply(self, actual: u64, expected: u64) -> bool {
        match self {
            Self::Eq => actual == expected,
            Self::Ne => actual != expected,
            Self::Gt => actual > expected,
            Self::Lt => actual < expected,
            Self::Ge => actual >= expected,
            Self::Le => actual <= expected,
        }
    }
}

/// The subfilters of a [`RequestFilter::Nand`].
///
/// The payload is private so the only way to build a NAND is
/// [`RequestFilter::nand`], which enforces the non-empty invariant.
#[derive(Debug, Clone)]
pub struct NandChain(Vec<RequestFilter>);

impl NandChain {
    pub fn filters(&self) -> &[RequestFilter] {
        &self.0
    }
}

/// An admission predicate over a decoded request.
///
/// Build leaf filters with [`string_option`](Self::string_option) and
/// [`num_option`](Self::num_option), compose them with
/// [`nand`](Self::nand), and evaluate with
/// [`is_accepted`](Self::is_accepted).
#[derive(Debug, Clone)]
pub enum RequestFilter {
    /// Accepts every message. The default for unfiltered subnets.
    AlwaysAccept,

    /// Accepts iff at least one subfilter rejects.
    ///
    /// Equivalently: rejects only when every subfilter accepts. Note
    /// this is not a conjunction; a chain of one subfilter inverts it,
    /// and `Nand([f])` nested twice restores `f`.
    Nand(NandChain),

    /// Compares an option's value as text against a pattern.
    StringOption {
        code: u8,
        pattern: String,
        mode: StringMatchMode,
        /// Compiled full-string form of `pattern`; `None` unless
        /// `mode` is [`StringMatchMode::Regex`].
        regex: Option<Regex>,
    },

    /// Compares an option's value as a big-endian unsigned integer.
    NumOption {
        code: u8,
        value: u64,
        operator: NumOperator,
    },
}

impl RequestFilter {
    /// Builds a NAND composition over `subfilters`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilter`] for an empty subfilter list,
    /// which would have no defined truth value.
    pub fn nand(subfilters: Vec<RequestFilter>) -> Result<Self> {
        if subfilters.is_empty() {
            return Err(Error::InvalidFilter(
                "nand requires at least one subfilter".to_string(),
            ));
        }
        Ok(Self::Nand(NandChain(subfilters)))
    }

    /// Builds a string filter over option `code`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilter`] if `mode` is
    /// [`StringMatchMode::Regex`] and `pattern` does not compile.
    pub fn string_option(code: u8, pattern: &str, mode: StringMatchMode) -> Result<Self> {
        let regex = match mode {
            StringMatchMode::Regex => {
                // Anchored so the pattern must cover the whole value.
                let anchored = format!(r"\A(?:{})\z", pattern);
                Some(Regex::new(&anchored).map_err(|e| {
                    Error::InvalidFilter(format!("bad pattern for option {}: {}", code, e))
                })?)
            }
            _ => None,
        };
        Ok(Self::StringOption {
            code,
            pattern: pattern.to_string(),
            mode,
            regex,
        })
    }

    /// Builds a numeric filter over option `code`.
    pub fn num_option(code: u8, value: u64, operator: NumOperator) -> Self {
        Self::NumOption {
            code,
            value,
            operator,
        }
    }

    /// Evaluates the filter against `message`.
    ///
    /// Option-reading filters reject when the option is absent or its
    /// value cannot be read in the expected shape, regardless of the
    /// operator.
    pub fn is_accepted(&self, message: &DhcpMessage) -> bool {
        match self {
            Self::AlwaysAccept => true,
            Self::Nand(chain) => {
                chain.0.iter().any(|filter| !filter.is_accepted(message))
            }
            Self::StringOption {
                code,
                pattern,
                mode,
                regex,
            } => {
                let Some(value) = message.option(*code) else {
                    return false;
                };
                let text = options::value_as_text(value);
                match mode {
                    StringMatchMode::Exact => text == *pattern,
                    StringMatchMode::CaseInsensitive => text.eq_ignore_ascii_case(pattern),
                    StringMatchMode::Regex => regex
                        .as_ref()
                        .map(|re| re.is_match(&text))
                        .unwrap_or(false),
                }
            }
            Self::NumOption {
                code,
                value,
                operator,
            } => {
                let Some(raw) = message.option(*code) else {
                    return false;
                };
                match options::value_as_uint(raw) {
                    Some(actual) => operator.apply(actual, *value),
                    None => false,
                }
            }
        }
    }
}

impl Default for RequestFilter {
    fn default() -> Self {
        Self::AlwaysAccept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{OPT_LEASE_TIME, OPT_VENDOR_CLASS};

    fn message_with_option(code: u8, value: &[u8]) -> DhcpMessage {
        let mut message = DhcpMessage::default();
        message.insert_option(code, value.to_vec()).unwrap();
        message
    }

    // A filter that rejects everything, built from the primitives.
    fn always_reject() -> RequestFilter {
        RequestFilter::nand(vec![RequestFilter::AlwaysAccept]).unwrap()
    }

    #[test]
    fn test_always_accept() {
        let filter = RequestFilter::AlwaysAccept;
        assert!(filter.is_accepted(&DhcpMessage::default()));
    }

    #[test]
    fn test_nand_rejects_when_all_accept() {
        let filter =
            RequestFilter::nand(vec![RequestFilter::AlwaysAccept, RequestFilter::AlwaysAccept])
                .unwrap();
        assert!(!filter.is_accepted(&DhcpMessage::default()));
    }

    #[test]
    fn test_nand_accepts_when_any_rejects() {
        let filter =
            RequestFilter::nand(vec![always_reject(), RequestFilter::AlwaysAccept]).unwrap();
        assert!(filter.is_accepted(&DhcpMessage::default()));
    }

    #[test]
    fn test_nand_requires_subfilters() {
        assert!(RequestFilter::nand(vec![]).is_err());
    }

    #[test]
    fn test_nand_payload_only_via_constructor() {
        // The chain is readable but only `nand` can build one, so an
        // empty (reject-everything) chain cannot be smuggled in.
        let filter =
            RequestFilter::nand(vec![RequestFilter::AlwaysAccept, RequestFilter::AlwaysAccept])
                .unwrap();
        let RequestFilter::Nand(chain) = &filter else {
            panic!("nand built a different variant");
        };
        assert_eq!(chain.filters().len(), 2);
        assert!(!chain.filters().is_empty());
    }

    #[test]
    fn test_double_nand_restores_filter() {
        let message = message_with_option(OPT_VENDOR_CLASS, b"udhcp");
        let inner =
            RequestFilter::string_option(OPT_VENDOR_CLASS, "udhcp", StringMatchMode::Exact)
                .unwrap();
        assert!(inner.is_accepted(&message));

        let double = RequestFilter::nand(vec![RequestFilter::nand(vec![inner]).unwrap()]).unwrap();
        assert!(double.is_accepted(&message));
        assert!(!double.is_accepted(&DhcpMessage::default()));
    }

    #[test]
    fn test_string_exact() {
        let filter =
            RequestFilter::string_option(OPT_VENDOR_CLASS, "MSFT 5.0", StringMatchMode::Exact)
                .unwrap();
        assert!(filter.is_accepted(&message_with_option(OPT_VENDOR_CLASS, b"MSFT 5.0")));
        assert!(!filter.is_accepted(&message_with_option(OPT_VENDOR_CLASS, b"msft 5.0")));
        assert!(!filter.is_accepted(&message_with_option(OPT_VENDOR_CLASS, b"MSFT 5.0 ")));
    }

    #[test]
    fn test_string_case_insensitive() {
        let filter = RequestFilter::string_option(
            OPT_VENDOR_CLASS,
            "msft 5.0",
            StringMatchMode::CaseInsensitive,
        )
        .unwrap();
        assert!(filter.is_accepted(&message_with_option(OPT_VENDOR_CLASS, b"MSFT 5.0")));
        assert!(!filter.is_accepted(&message_with_option(OPT_VENDOR_CLASS, b"MSFT 6.0")));
    }

    #[test]
    fn test_string_regex_is_full_match() {
        let filter =
            RequestFilter::string_option(OPT_VENDOR_CLASS, "MSFT.*", StringMatchMode::Regex)
                .unwrap();
        assert!(filter.is_accepted(&message_with_option(OPT_VENDOR_CLASS, b"MSFT 5.0")));
        // A substring hit is not enough.
        assert!(!filter.is_accepted(&message_with_option(OPT_VENDOR_CLASS, b"x MSFT 5.0")));
    }

    #[test]
    fn test_string_bad_regex_rejected_at_construction() {
        assert!(
            RequestFilter::string_option(OPT_VENDOR_CLASS, "[unclosed", StringMatchMode::Regex)
                .is_err()
        );
    }

    #[test]
    fn test_absent_option_rejects() {
        let message = DhcpMessage::default();

        let string = RequestFilter::string_option(OPT_VENDOR_CLASS, "x", StringMatchMode::Exact)
            .unwrap();
        assert!(!string.is_accepted(&message));

        // NE would be vacuously true, but absence still rejects.
        let num = RequestFilter::num_option(OPT_LEASE_TIME, 3600, NumOperator::Ne);
        assert!(!num.is_accepted(&message));
    }

    #[test]
    fn test_num_operators() {
        let message = message_with_option(OPT_LEASE_TIME, &3600u32.to_be_bytes());

        let cases = [
            (NumOperator::Eq, 3600, true),
            (NumOperator::Eq, 3601, false),
            (NumOperator::Ne, 3601, true),
            (NumOperator::Gt, 3599, true),
            (NumOperator::Gt, 3600, false),
            (NumOperator::Lt, 3601, true),
            (NumOperator::Ge, 3600, true),
            (NumOperator::Le, 3600, true),
            (NumOperator::Le, 3599, false),
        ];
        for (operator, value, expected) in cases {
            let filter = RequestFilter::num_option(OPT_LEASE_TIME, value, operator);
            assert_eq!(filter.is_accepted(&message), expected, "{:?} {}", operator, value);
        }
    }

    #[test]
    fn test_num_odd_width_rejects() {
        // Three bytes is not a valid integer width.
        let message = message_with_option(OPT_LEASE_TIME, &[0, 14, 16]);
        let filter = RequestFilter::num_option(OPT_LEASE_TIME, 3600, NumOperator::Eq);
        assert!(!filter.is_accepted(&message));
    }
}
