//! MQTT topic filter validation and matching.
//!
//! A filter may contain `+` as a single-level wildcard and `#` as a
//! multi-level wildcard, the latter only as the terminal segment.

use crate::topic::Topic;
use std::{borrow, cmp, fmt, ops};

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

/// A validated MQTT topic filter, borrowed.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Filter(str);

/// An owned, validated MQTT topic filter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterBuf(String);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InvalidFilter {
	#[error("filter cannot be empty")]
	Empty,
	#[error("filter cannot exceed maximum length for an MQTT string (65,535 bytes)")]
	TooLong,
	#[error("filter levels cannot mix wildcard and non-wildcard characters")]
	InvalidLevel,
	#[error("filter cannot contain more than one multi-level wildcard")]
	MultipleMultiLevelWildcards,
	#[error("multi-level wildcard can only appear as the final filter level")]
	NonTerminalMultiLevelWildcard,
}

/// How specifically a filter matched a topic; used to prefer the most
/// specific of several overlapping filters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Matches {
	pub exact: usize,
	pub wildcard: usize,
	pub multi_wildcard: usize,
}

impl Matches {
	pub fn score(&self) -> usize {
		self.exact * 100 + self.wildcard * 10 + self.multi_wildcard
	}
}

impl cmp::PartialOrd for Matches {
	fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl cmp::Ord for Matches {
	fn cmp(&self, other: &Self) -> cmp::Ordering {
		self.score().cmp(&other.score())
	}
}

impl Filter {
	pub fn new<S: AsRef<str> + ?Sized>(filter: &S) -> Result<&Filter, InvalidFilter> {
		let filter = filter.as_ref();

		if filter.is_empty() {
			return Err(InvalidFilter::Empty);
		}

		if filter.len() > u16::MAX as usize {
			return Err(InvalidFilter::TooLong);
		}

		let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
		let last = levels.len() - 1;
		let mut seen_multi = false;

		for (position, level) in levels.iter().enumerate() {
			let has_wildcard = level.contains('+') || level.contains('#');
			if has_wildcard && level.len() > 1 {
				return Err(InvalidFilter::InvalidLevel);
			}

			if *level == MULTI_LEVEL_WILDCARD {
				if seen_multi {
					return Err(InvalidFilter::MultipleMultiLevelWildcards);
				}
				seen_multi = true;
				if position != last {
					return Err(InvalidFilter::NonTerminalMultiLevelWildcard);
				}
			}
		}

		Ok(Self::from_str(filter))
	}

	/// Determines whether `topic` would be delivered under this filter.
	///
	/// Returns `None` if there's no match; otherwise a [`Matches`] score
	/// useful for preferring the most specific of several matching filters.
	pub fn matches_topic(&self, topic: &Topic) -> Option<Matches> {
		let mut filter_levels = self.0.split(LEVEL_SEPARATOR);
		let mut topic_levels = topic.levels();
		let mut result = Matches::default();

		for filter_level in filter_levels.by_ref() {
			match filter_level {
				MULTI_LEVEL_WILDCARD => {
					let remaining = topic_levels.by_ref().count();
					result.multi_wildcard += remaining;
					return Some(result);
				}
				SINGLE_LEVEL_WILDCARD => {
					topic_levels.next()?;
					result.wildcard += 1;
				}
				exact => {
					if topic_levels.next() != Some(exact) {
						return None;
					}
					result.exact += 1;
				}
			}
		}

		// Filter exhausted; topic must be exhausted too for an exact match.
		if topic_levels.next().is_some() {
			None
		} else {
			Some(result)
		}
	}

	#[inline]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	fn from_str(s: &str) -> &Self {
		unsafe { &*(s as *const str as *const Filter) }
	}
}

impl FilterBuf {
	pub fn new(filter: impl Into<String>) -> Result<Self, InvalidFilter> {
		let filter = filter.into();
		Filter::new(&filter)?;
		Ok(Self(filter))
	}

	#[inline]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	#[inline]
	pub fn into_inner(self) -> String {
		self.0
	}
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl fmt::Display for FilterBuf {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl AsRef<str> for FilterBuf {
	#[inline]
	fn as_ref(&self) -> &str {
		&self.0
	}
}

impl ops::Deref for FilterBuf {
	type Target = Filter;
	#[inline]
	fn deref(&self) -> &Self::Target {
		Filter::from_str(&self.0)
	}
}

impl borrow::Borrow<Filter> for FilterBuf {
	#[inline]
	fn borrow(&self) -> &Filter {
		use ops::Deref;
		self.deref()
	}
}

impl TryFrom<&str> for FilterBuf {
	type Error = InvalidFilter;
	#[inline]
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl TryFrom<String> for FilterBuf {
	type Error = InvalidFilter;
	#[inline]
	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}
