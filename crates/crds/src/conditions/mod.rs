//! Condition registry
//!
//! Typed condition types and reasons for every virtualization resource, plus
//! helpers to read and update a condition list.
//!
//! A condition's `lastTransitionTime` moves only when its status or reason
//! changes, so re-applying the same condition on every reconcile does not
//! produce status churn.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares a string-backed enum with `as_str` and `Display`.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            /// Returns the exact string published in the status.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $value, )+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }
    };
}

pub mod image;
pub mod vm;
pub mod vmbda;
pub mod vmip;

/// Status of a condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition state cannot be determined yet
    #[default]
    Unknown,
}

/// A single status condition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Generation of the object the condition was computed for
    #[serde(default)]
    pub observed_generation: i64,

    /// Last time the status or reason changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Returns true if the condition status is `True`.
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Builds a condition for the given object generation.
///
/// Messages are trimmed and get their first letter capitalized.
#[derive(Debug, Clone)]
pub struct ConditionBuilder {
    type_: String,
    status: ConditionStatus,
    reason: String,
    message: String,
    generation: i64,
}

impl ConditionBuilder {
    /// Starts a builder for the condition type.
    pub fn new(type_: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::Unknown,
            reason: String::new(),
            message: String::new(),
            generation: 0,
        }
    }

    /// Sets the object generation.
    #[must_use]
    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn status(mut self, status: ConditionStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Sets the message.
    #[must_use]
    pub fn message(mut self, message: impl AsRef<str>) -> Self {
        self.message = capitalize_first_letter(message.as_ref().trim());
        self
    }

    /// Clears the message.
    #[must_use]
    pub fn clear_message(mut self) -> Self {
        self.message.clear();
        self
    }

    /// Returns the condition; the transition time is assigned on `set_condition`.
    #[must_use]
    pub fn build(self) -> Condition {
        Condition {
            type_: self.type_,
            status: self.status,
            reason: self.reason,
            message: self.message,
            observed_generation: self.generation,
            last_transition_time: None,
        }
    }
}

/// Capitalizes the first character of a message.
#[must_use]
pub fn capitalize_first_letter(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Finds a condition by type.
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Sets a condition, replacing one of the same type.
///
/// The transition time is kept when neither status nor reason changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    set_condition_at(conditions, &mut condition, Utc::now());
}

fn set_condition_at(conditions: &mut Vec<Condition>, condition: &mut Condition, now: DateTime<Utc>) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status || existing.reason != condition.reason {
                existing.status = condition.status;
                existing.reason = std::mem::take(&mut condition.reason);
                existing.last_transition_time = Some(now);
            }
            existing.message = std::mem::take(&mut condition.message);
            existing.observed_generation = condition.observed_generation;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition.clone());
        }
    }
}

/// Removes a condition by type.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Returns true if the condition was computed for the current generation.
#[must_use]
pub fn is_last_updated(condition: &Condition, generation: i64) -> bool {
    condition.observed_generation == generation
}
