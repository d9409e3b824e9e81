//! Display filters over the call list.
//!
//! Seven regex filters, all case-insensitive, evaluated against a
//! call's first message (the payload filter walks every message). The
//! outcome is memoized on the call until the memo is reset.

use crate::attribute::Attribute;
use crate::call::Call;
use crate::error::{StorageError, StorageResult};
use regex::{Regex, RegexBuilder};

/// The filterable dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FilterType {
    /// SIP From header.
    SipFrom = 0,
    /// SIP To header.
    SipTo,
    /// Source address.
    Source,
    /// Destination address.
    Destination,
    /// Request method / response code.
    Method,
    /// Any message payload in the call.
    Payload,
    /// Rendered call-list line.
    CallListLine,
}

/// Number of filter slots.
const FILTER_COUNT: usize = 7;

/// One compiled filter.
#[derive(Debug, Clone)]
struct Filter {
    expr: String,
    regex: Regex,
}

/// The filter set applied to the call list.
#[derive(Debug, Default)]
pub struct Filters {
    slots: [Option<Filter>; FILTER_COUNT],
}

impl Filters {
    /// Creates an empty filter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or clears one filter.
    ///
    /// The expression is compiled case-insensitive before the previous
    /// filter is replaced, so an invalid pattern leaves it untouched.
    pub fn set(&mut self, kind: FilterType, expr: Option<&str>) -> StorageResult<()> {
        let filter = match expr {
            None => None,
            Some(expr) => {
                let regex = RegexBuilder::new(expr)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| StorageError::InvalidFilterExpression {
                        expression: expr.to_string(),
                        message: e.to_string(),
                    })?;
                Some(Filter {
                    expr: expr.to_string(),
                    regex,
                })
            }
        };

        self.slots[kind as usize] = filter;
        Ok(())
    }

    /// The source expression of one filter.
    #[must_use]
    pub fn get(&self, kind: FilterType) -> Option<&str> {
        self.slots[kind as usize].as_ref().map(|f| f.expr.as_str())
    }

    /// Evaluates every configured filter against a call, memoizing the
    /// outcome in the call's `filtered` state.
    ///
    /// Returns true when the call passes all filters.
    pub fn check_call(&self, call: &mut Call) -> bool {
        if call.msg_count() == 0 {
            return false;
        }

        if let Some(outcome) = call.filtered {
            return outcome;
        }

        let outcome = self.evaluate(call);
        call.filtered = Some(outcome);
        outcome
    }

    fn evaluate(&self, call: &Call) -> bool {
        const KINDS: [FilterType; FILTER_COUNT] = [
            FilterType::SipFrom,
            FilterType::SipTo,
            FilterType::Source,
            FilterType::Destination,
            FilterType::Method,
            FilterType::Payload,
            FilterType::CallListLine,
        ];

        for kind in KINDS {
            let Some(filter) = &self.slots[kind as usize] else {
                continue;
            };

            let matched = match kind {
                FilterType::SipFrom => filter.regex.is_match(&call.attribute(Attribute::SipFrom)),
                FilterType::SipTo => filter.regex.is_match(&call.attribute(Attribute::SipTo)),
                FilterType::Source => filter.regex.is_match(&call.attribute(Attribute::Src)),
                FilterType::Destination => {
                    filter.regex.is_match(&call.attribute(Attribute::Dst))
                }
                FilterType::Method => filter.regex.is_match(&call.attribute(Attribute::Method)),
                FilterType::Payload => call
                    .messages()
                    .iter()
                    .any(|m| filter.regex.is_match(m.payload())),
                FilterType::CallListLine => filter.regex.is_match(&call.summary_line()),
            };

            if !matched {
                return false;
            }
        }

        true
    }

    /// Builds the method filter from a comma-separated settings value.
    pub fn set_methods_from_setting(&mut self, value: &str) -> StorageResult<()> {
        if value.is_empty() {
            return self.set(FilterType::Method, None);
        }
        let pattern = format!("({})", value.replace(',', "|"));
        self.set(FilterType::Method, Some(&pattern))
    }
}

/// Clears the filter memo on every call so the next evaluation starts
/// from scratch.
pub fn reset_calls(calls: &mut [Call]) {
    for call in calls {
        call.filtered = None;
    }
}
