//! # Rules
//!
//! The boolean rule language consumer targets use to select records: a list of condition groups
//! combined by `group_logic`, each group a list of conditions combined by its own `logic`.
//!
//! Evaluation is total. A condition that cannot be evaluated (unknown field, unknown operator, an
//! operator that does not apply to the field, a malformed literal or regex) produces a
//! `RuleError`; at the group level that error is logged and the condition counts as false.
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::record::{EmailAddress, EmailRecord};

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("{0} is not a supported field")]
    UnknownField(String),
    #[error("{0} is not a supported operator")]
    UnknownOperator(String),
    #[error("operator {operator} cannot be applied to {kind} field {field}")]
    UnsupportedOperator {
        field: Field,
        kind: FieldKind,
        operator: Operator,
    },
    #[error("operator {operator} expects {expected} as its value, got {value}")]
    InvalidValue {
        operator: Operator,
        expected: &'static str,
        value: Value,
    },
    #[error("invalid regex pattern")]
    InvalidRegex(#[from] regex::Error),
}

/// How conditions in a group, or groups in an expression, are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND", alias = "and", alias = "And")]
    And,
    #[serde(rename = "OR", alias = "or", alias = "Or")]
    Or,
}

impl Logic {
    /// Nothing to combine is a match under either logic.
    fn combine<I: IntoIterator<Item = bool>>(&self, results: I) -> bool {
        let mut results = results.into_iter().peekable();
        if results.peek().is_none() {
            return true;
        }

        match self {
            Logic::And => results.all(|r| r),
            Logic::Or => results.any(|r| r),
        }
    }
}

/// A single leaf test against one field of a record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Compiled `regex` operand with the case sensitivity it was built for.
    #[serde(skip)]
    pattern: OnceLock<(bool, Regex)>,
}

impl Condition {
    pub fn new(field: &str, operator: &str, value: Value) -> Self {
        Self {
            field: field.to_owned(),
            operator: operator.to_owned(),
            value,
            negate: false,
            case_sensitive: false,
            pattern: OnceLock::new(),
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    /// Check everything about this condition that does not depend on a record.
    pub fn validate(&self) -> Result<(), RuleError> {
        let (field, operator) = self.resolve()?;
        if operator == Operator::Regex {
            RegexBuilder::new(&literal_str(operator, &self.value)?).build()?;
        }
        check_supported(field, operator)
    }

    fn resolve(&self) -> Result<(Field, Operator), RuleError> {
        Ok((self.field.parse()?, self.operator.parse()?))
    }

    /// The `regex` operand, compiled on first use and reused for every later record.
    fn regex(&self) -> Result<Cow<'_, Regex>, RuleError> {
        if let Some((case_sensitive, pattern)) = self.pattern.get() {
            if *case_sensitive == self.case_sensitive {
                return Ok(Cow::Borrowed(pattern));
            }
        }

        let pattern = RegexBuilder::new(&literal_str(Operator::Regex, &self.value)?)
            .case_insensitive(!self.case_sensitive)
            .build()?;

        // A cache built for the other case sensitivity is left alone.
        if self.pattern.get().is_some() {
            return Ok(Cow::Owned(pattern));
        }
        let (_, cached) = self
            .pattern
            .get_or_init(|| (self.case_sensitive, pattern));
        Ok(Cow::Borrowed(cached))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    /// An empty group matches everything.
    pub fn evaluate(&self, record: &EmailRecord) -> bool {
        self.logic.combine(
            self.conditions
                .iter()
                .map(|condition| condition_holds(record, condition)),
        )
    }
}

/// The complete rule of a consumer target. With no groups it matches every record, which is how
/// unfiltered targets behave.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleExpression {
    #[serde(default)]
    pub condition_groups: Vec<ConditionGroup>,
    #[serde(default)]
    pub group_logic: Logic,
}

impl RuleExpression {
    pub fn evaluate(&self, record: &EmailRecord) -> bool {
        self.group_logic.combine(
            self.condition_groups
                .iter()
                .map(|group| group.evaluate(record)),
        )
    }

    /// Every configuration problem in this expression, for reporting at load time.
    pub fn problems(&self) -> Vec<RuleError> {
        self.condition_groups
            .iter()
            .flat_map(|group| group.conditions.iter())
            .filter_map(|condition| condition.validate().err())
            .collect()
    }
}

fn condition_holds(record: &EmailRecord, condition: &Condition) -> bool {
    match evaluate(record, condition) {
        Ok(result) => result,
        Err(error) => {
            warn!(
                field = %condition.field,
                operator = %condition.operator,
                "condition failed closed: {}",
                error
            );
            false
        }
    }
}

/// Fields of an `EmailRecord` a condition can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Subject,
    Body,
    BodyPreview,
    BodyType,
    FromAddress,
    FromName,
    Mailbox,
    Folder,
    Direction,
    InternetMessageId,
    ConversationId,
    ToRecipients,
    CcRecipients,
    BccRecipients,
    Recipients,
    AttachmentNames,
    AttachmentContentTypes,
    AttachmentCount,
    AttachmentTotalSize,
    HasAttachments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    List,
    Number,
    Flag,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldKind::Text => write!(f, "string"),
            FieldKind::List => write!(f, "list"),
            FieldKind::Number => write!(f, "numeric"),
            FieldKind::Flag => write!(f, "boolean"),
        }
    }
}

impl FromStr for Field {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "subject" => Ok(Field::Subject),
            "body" | "body_content" => Ok(Field::Body),
            "body_preview" => Ok(Field::BodyPreview),
            "body_type" => Ok(Field::BodyType),
            "from_address" | "sender" => Ok(Field::FromAddress),
            "from_name" => Ok(Field::FromName),
            "mailbox" => Ok(Field::Mailbox),
            "folder" => Ok(Field::Folder),
            "direction" => Ok(Field::Direction),
            "internet_message_id" => Ok(Field::InternetMessageId),
            "conversation_id" => Ok(Field::ConversationId),
            "to_recipients" => Ok(Field::ToRecipients),
            "cc_recipients" => Ok(Field::CcRecipients),
            "bcc_recipients" => Ok(Field::BccRecipients),
            "recipients" => Ok(Field::Recipients),
            "attachment_names" => Ok(Field::AttachmentNames),
            "attachment_content_types" => Ok(Field::AttachmentContentTypes),
            "attachment_count" => Ok(Field::AttachmentCount),
            "attachment_total_size" => Ok(Field::AttachmentTotalSize),
            "has_attachments" => Ok(Field::HasAttachments),
            _ => Err(RuleError::UnknownField(s.to_owned())),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Field::Subject => "subject",
            Field::Body => "body",
            Field::BodyPreview => "body_preview",
            Field::BodyType => "body_type",
            Field::FromAddress => "from_address",
            Field::FromName => "from_name",
            Field::Mailbox => "mailbox",
            Field::Folder => "folder",
            Field::Direction => "direction",
            Field::InternetMessageId => "internet_message_id",
            Field::ConversationId => "conversation_id",
            Field::ToRecipients => "to_recipients",
            Field::CcRecipients => "cc_recipients",
            Field::BccRecipients => "bcc_recipients",
            Field::Recipients => "recipients",
            Field::AttachmentNames => "attachment_names",
            Field::AttachmentContentTypes => "attachment_content_types",
            Field::AttachmentCount => "attachment_count",
            Field::AttachmentTotalSize => "attachment_total_size",
            Field::HasAttachments => "has_attachments",
        };
        write!(f, "{name}")
    }
}

impl Field {
    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Subject
            | Field::Body
            | Field::BodyPreview
            | Field::BodyType
            | Field::FromAddress
            | Field::FromName
            | Field::Mailbox
            | Field::Folder
            | Field::Direction
            | Field::InternetMessageId
            | Field::ConversationId => FieldKind::Text,
            Field::ToRecipients
            | Field::CcRecipients
            | Field::BccRecipients
            | Field::Recipients
            | Field::AttachmentNames
            | Field::AttachmentContentTypes => FieldKind::List,
            Field::AttachmentCount | Field::AttachmentTotalSize => FieldKind::Number,
            Field::HasAttachments => FieldKind::Flag,
        }
    }

    /// Project this field out of a record. Data the provider did not supply is stored as an empty
    /// string or list, so an absent field projects to its empty value.
    fn project<'a>(&self, record: &'a EmailRecord) -> Projected<'a> {
        let addresses = |recipients: &'a [EmailAddress]| {
            Projected::List(recipients.iter().map(|r| r.address.as_str()).collect())
        };

        match self {
            Field::Subject => Projected::Text(Cow::Borrowed(&record.subject)),
            Field::Body => Projected::Text(Cow::Borrowed(&record.body_content)),
            Field::BodyPreview => Projected::Text(Cow::Borrowed(&record.body_preview)),
            Field::BodyType => Projected::Text(Cow::Owned(record.body_type.to_string())),
            Field::FromAddress => Projected::Text(Cow::Borrowed(&record.from.address)),
            Field::FromName => Projected::Text(Cow::Borrowed(&record.from.name)),
            Field::Mailbox => Projected::Text(Cow::Borrowed(&record.mailbox)),
            Field::Folder => Projected::Text(Cow::Borrowed(&record.folder)),
            Field::Direction => Projected::Text(Cow::Owned(record.direction().to_string())),
            Field::InternetMessageId => {
                Projected::Text(Cow::Borrowed(&record.internet_message_id))
            }
            Field::ConversationId => Projected::Text(Cow::Borrowed(&record.conversation_id)),
            Field::ToRecipients => addresses(&record.to_recipients),
            Field::CcRecipients => addresses(&record.cc_recipients),
            Field::BccRecipients => addresses(&record.bcc_recipients),
            Field::Recipients => Projected::List(record.all_recipient_addresses().collect()),
            Field::AttachmentNames => Projected::List(
                record
                    .attachment_metadata
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect(),
            ),
            Field::AttachmentContentTypes => Projected::List(
                record
                    .attachment_metadata
                    .iter()
                    .map(|a| a.content_type.as_str())
                    .collect(),
            ),
            Field::AttachmentCount => Projected::Number(record.attachment_metadata.len() as f64),
            Field::AttachmentTotalSize => Projected::Number(record.total_attachment_size() as f64),
            Field::HasAttachments => Projected::Flag(record.has_attachments()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    Between,
    IsEmpty,
    IsNotEmpty,
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "equals" => Ok(Operator::Equals),
            "not_equals" => Ok(Operator::NotEquals),
            "contains" => Ok(Operator::Contains),
            "not_contains" => Ok(Operator::NotContains),
            "starts_with" => Ok(Operator::StartsWith),
            "ends_with" => Ok(Operator::EndsWith),
            "regex" => Ok(Operator::Regex),
            "in" => Ok(Operator::In),
            "not_in" => Ok(Operator::NotIn),
            "greater_than" => Ok(Operator::GreaterThan),
            "less_than" => Ok(Operator::LessThan),
            "between" => Ok(Operator::Between),
            "is_empty" => Ok(Operator::IsEmpty),
            "is_not_empty" => Ok(Operator::IsNotEmpty),
            _ => Err(RuleError::UnknownOperator(s.to_owned())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::Regex => "regex",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::Between => "between",
            Operator::IsEmpty => "is_empty",
            Operator::IsNotEmpty => "is_not_empty",
        };
        write!(f, "{name}")
    }
}

impl Operator {
    fn applies_to(&self, kind: FieldKind) -> bool {
        match kind {
            FieldKind::Text => !matches!(
                self,
                Operator::GreaterThan | Operator::LessThan | Operator::Between
            ),
            FieldKind::List => matches!(
                self,
                Operator::Contains
                    | Operator::NotContains
                    | Operator::IsEmpty
                    | Operator::IsNotEmpty
            ),
            FieldKind::Number => matches!(
                self,
                Operator::Equals
                    | Operator::NotEquals
                    | Operator::GreaterThan
                    | Operator::LessThan
                    | Operator::Between
            ),
            FieldKind::Flag => matches!(self, Operator::Equals | Operator::NotEquals),
        }
    }
}

fn check_supported(field: Field, operator: Operator) -> Result<(), RuleError> {
    if operator.applies_to(field.kind()) {
        Ok(())
    } else {
        Err(RuleError::UnsupportedOperator {
            field,
            kind: field.kind(),
            operator,
        })
    }
}

enum Projected<'a> {
    Text(Cow<'a, str>),
    List(Vec<&'a str>),
    Number(f64),
    Flag(bool),
}

/// Evaluate one condition against a record.
///
/// The field is projected out of the record, string operands are case-folded unless the
/// condition is case sensitive, the operator is applied, and the result is inverted when the
/// condition is negated.
pub fn evaluate(record: &EmailRecord, condition: &Condition) -> Result<bool, RuleError> {
    let (field, operator) = condition.resolve()?;
    check_supported(field, operator)?;

    let value = &condition.value;
    let case_sensitive = condition.case_sensitive;

    let result = match field.project(record) {
        Projected::Text(text) if operator == Operator::Regex => condition.regex()?.is_match(&text),
        Projected::Text(text) => match_text(operator, &text, value, case_sensitive)?,
        Projected::List(items) => match_list(operator, &items, value, case_sensitive)?,
        Projected::Number(number) => match_number(operator, number, value)?,
        Projected::Flag(flag) => match_flag(operator, flag, value)?,
    };

    Ok(result != condition.negate)
}

fn fold(s: &str, case_sensitive: bool) -> Cow<'_, str> {
    if case_sensitive {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(s.to_lowercase())
    }
}

fn match_text(
    operator: Operator,
    text: &str,
    value: &Value,
    case_sensitive: bool,
) -> Result<bool, RuleError> {
    let text = fold(text, case_sensitive);

    match operator {
        Operator::IsEmpty => Ok(text.is_empty()),
        Operator::IsNotEmpty => Ok(!text.is_empty()),
        Operator::In | Operator::NotIn => {
            let is_member = literal_list(operator, value)?
                .iter()
                .any(|candidate| fold(candidate, case_sensitive) == text);
            Ok(is_member == (operator == Operator::In))
        }
        _ => {
            let literal = literal_str(operator, value)?;
            let literal = fold(&literal, case_sensitive);
            match operator {
                Operator::Equals => Ok(text == literal),
                Operator::NotEquals => Ok(text != literal),
                Operator::Contains => Ok(text.contains(literal.as_ref())),
                Operator::NotContains => Ok(!text.contains(literal.as_ref())),
                Operator::StartsWith => Ok(text.starts_with(literal.as_ref())),
                Operator::EndsWith => Ok(text.ends_with(literal.as_ref())),
                _ => unreachable_operator(operator),
            }
        }
    }
}

fn match_list(
    operator: Operator,
    items: &[&str],
    value: &Value,
    case_sensitive: bool,
) -> Result<bool, RuleError> {
    match operator {
        Operator::IsEmpty => Ok(items.is_empty()),
        Operator::IsNotEmpty => Ok(!items.is_empty()),
        Operator::Contains | Operator::NotContains => {
            let literal = literal_str(operator, value)?;
            let literal = fold(&literal, case_sensitive);
            let any_contains = items
                .iter()
                .any(|item| fold(item, case_sensitive).contains(literal.as_ref()));
            Ok(any_contains == (operator == Operator::Contains))
        }
        _ => unreachable_operator(operator),
    }
}

fn match_number(operator: Operator, number: f64, value: &Value) -> Result<bool, RuleError> {
    match operator {
        Operator::Equals => Ok(number == literal_number(operator, value)?),
        Operator::NotEquals => Ok(number != literal_number(operator, value)?),
        Operator::GreaterThan => Ok(number > literal_number(operator, value)?),
        Operator::LessThan => Ok(number < literal_number(operator, value)?),
        Operator::Between => {
            let (low, high) = literal_bounds(operator, value)?;
            Ok(low <= number && number <= high)
        }
        _ => unreachable_operator(operator),
    }
}

fn match_flag(operator: Operator, flag: bool, value: &Value) -> Result<bool, RuleError> {
    let literal = match value {
        Value::Bool(b) => *b,
        Value::String(s) if s.eq_ignore_ascii_case("true") => true,
        Value::String(s) if s.eq_ignore_ascii_case("false") => false,
        _ => return Err(invalid_value(operator, "a boolean", value)),
    };

    match operator {
        Operator::Equals => Ok(flag == literal),
        Operator::NotEquals => Ok(flag != literal),
        _ => unreachable_operator(operator),
    }
}

/// `check_supported` runs before any matcher, so matchers never see an operator that does not
/// apply to their field kind. Kept as an error rather than a panic all the same.
fn unreachable_operator(operator: Operator) -> Result<bool, RuleError> {
    Err(RuleError::UnknownOperator(operator.to_string()))
}

fn invalid_value(operator: Operator, expected: &'static str, value: &Value) -> RuleError {
    RuleError::InvalidValue {
        operator,
        expected,
        value: value.clone(),
    }
}

fn literal_str(operator: Operator, value: &Value) -> Result<String, RuleError> {
    match value {
        Value::String(s) => Ok(s.to_owned()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(invalid_value(operator, "a string", value)),
    }
}

fn literal_list(operator: Operator, value: &Value) -> Result<Vec<String>, RuleError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| literal_str(operator, item))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid_value(operator, "a list of strings", value)),
        Value::String(s) => Ok(vec![s.to_owned()]),
        _ => Err(invalid_value(operator, "a list of strings", value)),
    }
}

fn literal_number(operator: Operator, value: &Value) -> Result<f64, RuleError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.ok_or_else(|| invalid_value(operator, "a number", value))
}

fn literal_bounds(operator: Operator, value: &Value) -> Result<(f64, f64), RuleError> {
    let bounds = match value {
        Value::Array(items) if items.len() == 2 => {
            (literal_number(operator, &items[0]), literal_number(operator, &items[1]))
        }
        Value::Object(object) => match (object.get("min"), object.get("max")) {
            (Some(min), Some(max)) => (literal_number(operator, min), literal_number(operator, max)),
            _ => return Err(invalid_value(operator, "a [min, max] pair", value)),
        },
        _ => return Err(invalid_value(operator, "a [min, max] pair", value)),
    };

    match bounds {
        (Ok(low), Ok(high)) => Ok((low, high)),
        _ => Err(invalid_value(operator, "a [min, max] pair", value)),
    }
}
