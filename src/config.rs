//! Construction options and their validation.
//!
//! [Options] is a loosely typed bag of named values, so callers can pass configuration through
//! from other layers. Unknown names are ignored. [Config::from_options] validates the names it
//! knows and fails fast with [Error::InvalidConfiguration].

use crate::{
    error::Error,
    slot_table::{MAX_CAPACITY, MIN_CAPACITY},
};
use std::cmp;


pub const INITIAL_CAPACITY: &str = "initial_capacity";
pub const LOAD_FACTOR: &str = "load_factor";
pub const CONCURRENCY_LEVEL: &str = "concurrency_level";

/// A dynamically typed option value.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    /// Unset. Treated the same as an absent option.
    Nil,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<i64> for OptionValue {
    #[inline]
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<i32> for OptionValue {
    #[inline]
    fn from(value: i32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<usize> for OptionValue {
    #[inline]
    fn from(value: usize) -> Self {
        i64::try_from(value)
            .map(OptionValue::Int)
            .unwrap_or(OptionValue::Float(value as f64))
    }
}

impl From<f64> for OptionValue {
    #[inline]
    fn from(value: f64) -> Self {
        OptionValue::Float(value)
    }
}

impl From<bool> for OptionValue {
    #[inline]
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<&str> for OptionValue {
    #[inline]
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_owned())
    }
}

impl From<String> for OptionValue {
    #[inline]
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl<T: Into<OptionValue>> From<Option<T>> for OptionValue {
    #[inline]
    fn from(value: Option<T>) -> Self {
        value.map_or(OptionValue::Nil, Into::into)
    }
}

/// Named construction options.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Options {
    values: Vec<(String, OptionValue)>,
}

impl Options {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option, replacing an earlier value with the same name.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<OptionValue>) {
        let name = name.into();
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }
}

impl<N: Into<String>, V: Into<OptionValue>> Extend<(N, V)> for Options {
    fn extend<I: IntoIterator<Item = (N, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

impl<N: Into<String>, V: Into<OptionValue>> FromIterator<(N, V)> for Options {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut options = Options::new();
        options.extend(iter);
        options
    }
}

impl IntoIterator for Options {
    type Item = (String, OptionValue);
    type IntoIter = std::vec::IntoIter<(String, OptionValue)>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

/// Validated configuration of a map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    initial_capacity: usize,
    load_factor: f64,
    concurrency_level: usize,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Config {
            initial_capacity: 16,
            load_factor: 0.75,
            concurrency_level: 16,
        }
    }
}

impl Config {
    /// Validates `options` and fills in defaults for anything unset.
    pub fn from_options(options: &Options) -> Result<Config, Error> {
        let mut config = Config::default();

        if let Some(capacity) =
            whole_number(options, INITIAL_CAPACITY, 0, "must not be negative")?
        {
            config.initial_capacity = capacity;
        }

        if let Some(load_factor) = fraction(options, LOAD_FACTOR)? {
            config.load_factor = load_factor;
        }

        if let Some(level) =
            whole_number(options, CONCURRENCY_LEVEL, 1, "must be at least 1")?
        {
            config.concurrency_level = level;
        }

        Ok(config)
    }

    #[inline]
    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    #[inline]
    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }

    #[inline]
    pub fn concurrency_level(&self) -> usize {
        self.concurrency_level
    }

    /// Number of slots in a fresh table.
    #[inline]
    pub(crate) fn table_capacity(&self) -> usize {
        cmp::max(
            cmp::max(self.initial_capacity, self.concurrency_level),
            MIN_CAPACITY,
        )
        .next_power_of_two()
    }
}

/// Reads a whole number in `min..=MAX_CAPACITY`. Values below `min` fail with `too_small`.
fn whole_number(
    options: &Options,
    option: &'static str,
    min: i64,
    too_small: &'static str,
) -> Result<Option<usize>, Error> {
    match options.get(option) {
        None | Some(OptionValue::Nil) => Ok(None),
        Some(&OptionValue::Int(value)) if value < min => Err(Error::invalid(option, too_small)),
        Some(&OptionValue::Int(value)) => match usize::try_from(value) {
            Ok(value) if value <= MAX_CAPACITY => Ok(Some(value)),
            _ => Err(Error::invalid(option, "must be at most 2^30")),
        },
        Some(_) => Err(Error::invalid(option, "must be a whole number")),
    }
}

fn fraction(options: &Options, option: &'static str) -> Result<Option<f64>, Error> {
    let value = match options.get(option) {
        None | Some(OptionValue::Nil) => return Ok(None),
        Some(&OptionValue::Int(value)) => value as f64,
        Some(&OptionValue::Float(value)) => value,
        Some(_) => return Err(Error::invalid(option, "must be a number")),
    };

    if value > 0.0 && value <= 1.0 {
        Ok(Some(value))
    } else {
        Err(Error::invalid(option, "must be greater than 0 and at most 1"))
    }
}
