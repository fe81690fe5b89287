//! Field type constraints
//!
//! A constraint is an immutable composition of named validators over one
//! primitive kind, plus the `required` / `allow_null` flags. Fluent builders
//! always return a fresh instance, so a base constraint can be shared and
//! extended without mutating the original.

use regex::{Regex, RegexBuilder};
use serde_json::Value;

const EMAIL_PATTERN: &str =
    r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$";
const ALPHANUM_PATTERN: &str = r"^[a-zA-Z0-9]*$";

/// Primitive kind a constraint validates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// UTF-8 string values.
    String,
    /// JSON numbers.
    Number,
    /// Booleans.
    Boolean,
    /// Any JSON value.
    Any,
}

/// One named validator inside a constraint chain.
#[derive(Debug, Clone)]
enum Rule {
    // string rules
    MinLength(usize),
    MaxLength(usize),
    Length(usize),
    Alphanum(Regex),
    Pattern(Regex),
    InvalidPattern(String),
    Email(Regex),
    Lowercase,
    Uppercase,
    Enum(Vec<String>),
    Uuid(Option<u8>, Regex),
    Multi,
    Blob,
    // number rules
    MinValue(f64),
    MaxValue(f64),
    Integer,
}

/// An immutable, composable field constraint.
#[derive(Debug, Clone)]
pub struct TypeConstraint {
    kind: ConstraintKind,
    rules: Vec<Rule>,
    required: bool,
    allow_null: bool,
}

/// Shorthand for [`TypeConstraint::string`].
pub fn string() -> TypeConstraint {
    TypeConstraint::string()
}

/// Shorthand for [`TypeConstraint::number`].
pub fn number() -> TypeConstraint {
    TypeConstraint::number()
}

/// Shorthand for [`TypeConstraint::boolean`].
pub fn boolean() -> TypeConstraint {
    TypeConstraint::boolean()
}

/// Shorthand for [`TypeConstraint::any`].
pub fn any() -> TypeConstraint {
    TypeConstraint::any()
}

impl TypeConstraint {
    fn new(kind: ConstraintKind) -> Self {
        Self {
            kind,
            rules: Vec::new(),
            required: false,
            allow_null: false,
        }
    }

    /// A string-valued constraint with no validators.
    pub fn string() -> Self {
        Self::new(ConstraintKind::String)
    }

    /// A number-valued constraint with no validators.
    pub fn number() -> Self {
        Self::new(ConstraintKind::Number)
    }

    /// A boolean constraint (type check only).
    pub fn boolean() -> Self {
        Self::new(ConstraintKind::Boolean)
    }

    /// A constraint accepting any JSON value.
    pub fn any() -> Self {
        Self::new(ConstraintKind::Any)
    }

    fn with_rule(&self, rule: Rule) -> Self {
        let mut next = self.clone();
        next.rules.push(rule);
        next
    }

    /// The field must be present.
    pub fn required(&self) -> Self {
        let mut next = self.clone();
        next.required = true;
        next
    }

    /// Null is accepted without running any validators.
    pub fn allow_null(&self) -> Self {
        let mut next = self.clone();
        next.allow_null = true;
        next
    }

    /// Minimum string length or minimum numeric value, depending on kind.
    pub fn min(&self, n: f64) -> Self {
        match self.kind {
            ConstraintKind::Number => self.with_rule(Rule::MinValue(n)),
            _ => self.with_rule(Rule::MinLength(n as usize)),
        }
    }

    /// Maximum string length or maximum numeric value, depending on kind.
    pub fn max(&self, n: f64) -> Self {
        match self.kind {
            ConstraintKind::Number => self.with_rule(Rule::MaxValue(n)),
            _ => self.with_rule(Rule::MaxLength(n as usize)),
        }
    }

    /// Exact string length.
    pub fn length(&self, n: usize) -> Self {
        self.with_rule(Rule::Length(n))
    }

    /// Letters and digits only.
    pub fn alphanum(&self) -> Self {
        match Regex::new(ALPHANUM_PATTERN) {
            Ok(re) => self.with_rule(Rule::Alphanum(re)),
            Err(_) => self.with_rule(Rule::InvalidPattern(ALPHANUM_PATTERN.to_string())),
        }
    }

    /// The value must match `pattern`. The only supported flag is `i`
    /// (case-insensitive); an uncompilable pattern makes every value fail.
    pub fn regex(&self, pattern: &str, flags: Option<&str>) -> Self {
        let case_insensitive = flags.is_some_and(|f| f.contains('i'));
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build();
        match compiled {
            Ok(re) => self.with_rule(Rule::Pattern(re)),
            Err(_) => self.with_rule(Rule::InvalidPattern(pattern.to_string())),
        }
    }

    /// The value must be an email address.
    pub fn email(&self) -> Self {
        match Regex::new(EMAIL_PATTERN) {
            Ok(re) => self.with_rule(Rule::Email(re)),
            Err(_) => self.with_rule(Rule::InvalidPattern(EMAIL_PATTERN.to_string())),
        }
    }

    /// Sanitize the value to lowercase.
    pub fn lowercase(&self) -> Self {
        self.with_rule(Rule::Lowercase)
    }

    /// Sanitize the value to uppercase.
    pub fn uppercase(&self) -> Self {
        self.with_rule(Rule::Uppercase)
    }

    /// The value must be one of `values`.
    pub fn enumeration<I, S>(&self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_rule(Rule::Enum(values.into_iter().map(Into::into).collect()))
    }

    /// The value must be a UUID, optionally of a specific version.
    pub fn uuid(&self, version: Option<u8>) -> Self {
        let version_class = match version {
            Some(v @ 1..=5) => v.to_string(),
            Some(_) | None => "1-5".to_string(),
        };
        let pattern = format!(
            "^[0-9a-f]{{8}}-[0-9a-f]{{4}}-[{version_class}][0-9a-f]{{3}}-[89ab][0-9a-f]{{3}}-[0-9a-f]{{12}}$"
        );
        let compiled = RegexBuilder::new(&pattern).case_insensitive(true).build();
        match compiled {
            Ok(re) => self.with_rule(Rule::Uuid(version, re)),
            Err(_) => self.with_rule(Rule::InvalidPattern(pattern)),
        }
    }

    /// Mark the field as a comma-separated multi value.
    ///
    /// Multi fields are treated as sets by the view channel router.
    pub fn multi(&self) -> Self {
        self.with_rule(Rule::Multi)
    }

    /// Mark the field as an opaque blob string.
    pub fn blob(&self) -> Self {
        self.with_rule(Rule::Blob)
    }

    /// The number must be a mathematical integer.
    pub fn integer(&self) -> Self {
        self.with_rule(Rule::Integer)
    }

    /// Whether the field is mandatory.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Whether null short-circuits validation.
    pub fn allows_null(&self) -> bool {
        self.allow_null
    }

    /// Whether this field carries comma-separated multi semantics.
    pub fn is_multi(&self) -> bool {
        self.rules.iter().any(|r| matches!(r, Rule::Multi))
    }

    /// The primitive kind this constraint validates.
    pub fn kind(&self) -> ConstraintKind {
        self.kind
    }

    /// Validate one field value.
    ///
    /// `value` is `None` when the field is absent from the record. Returns the
    /// sanitized value to store (`None` means "leave the field out"), or a
    /// message describing the first violated rule.
    pub fn check(&self, value: Option<&Value>) -> std::result::Result<Option<Value>, String> {
        let value = match value {
            None => {
                if self.required {
                    return Err("Field is required".to_string());
                }
                return Ok(None);
            }
            Some(v) => v,
        };

        if value.is_null() && self.allow_null {
            return Ok(Some(Value::Null));
        }

        let mut current = self.check_kind(value)?;
        for rule in &self.rules {
            current = apply_rule(rule, current)?;
        }
        Ok(Some(current))
    }

    fn check_kind(&self, value: &Value) -> std::result::Result<Value, String> {
        let ok = match self.kind {
            ConstraintKind::String => value.is_string(),
            ConstraintKind::Number => value.is_number(),
            ConstraintKind::Boolean => value.is_boolean(),
            ConstraintKind::Any => true,
        };
        if ok {
            Ok(value.clone())
        } else {
            Err(format!(
                "Expected a value of type {}",
                kind_name(self.kind)
            ))
        }
    }
}

fn kind_name(kind: ConstraintKind) -> &'static str {
    match kind {
        ConstraintKind::String => "string",
        ConstraintKind::Number => "number",
        ConstraintKind::Boolean => "boolean",
        ConstraintKind::Any => "any",
    }
}

fn expect_str(value: &Value) -> std::result::Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| "Expected a value of type string".to_string())
}

fn expect_num(value: &Value) -> std::result::Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| "Expected a value of type number".to_string())
}

fn apply_rule(rule: &Rule, value: Value) -> std::result::Result<Value, String> {
    match rule {
        Rule::MinLength(n) => {
            if expect_str(&value)?.chars().count() < *n {
                return Err(format!("Value must be at least {n} characters long"));
            }
            Ok(value)
        }
        Rule::MaxLength(n) => {
            if expect_str(&value)?.chars().count() > *n {
                return Err(format!("Value must be at most {n} characters long"));
            }
            Ok(value)
        }
        Rule::Length(n) => {
            if expect_str(&value)?.chars().count() != *n {
                return Err(format!("Value must be exactly {n} characters long"));
            }
            Ok(value)
        }
        Rule::Alphanum(re) => {
            if !re.is_match(expect_str(&value)?) {
                return Err("Value must only contain letters and digits".to_string());
            }
            Ok(value)
        }
        Rule::Pattern(re) => {
            if !re.is_match(expect_str(&value)?) {
                return Err(format!("Value must match the pattern {}", re.as_str()));
            }
            Ok(value)
        }
        Rule::InvalidPattern(pattern) => {
            Err(format!("Constraint pattern {pattern} did not compile"))
        }
        Rule::Email(re) => {
            if !re.is_match(expect_str(&value)?) {
                return Err("Value must be an email address".to_string());
            }
            Ok(value)
        }
        Rule::Lowercase => Ok(Value::String(expect_str(&value)?.to_lowercase())),
        Rule::Uppercase => Ok(Value::String(expect_str(&value)?.to_uppercase())),
        Rule::Enum(values) => {
            let s = expect_str(&value)?;
            if !values.iter().any(|v| v == s) {
                return Err(format!("Value must be one of: {}", values.join(", ")));
            }
            Ok(value)
        }
        Rule::Uuid(version, re) => {
            if !re.is_match(expect_str(&value)?) {
                return Err(match version {
                    Some(v) => format!("Value must be a version {v} UUID"),
                    None => "Value must be a UUID".to_string(),
                });
            }
            Ok(value)
        }
        Rule::Multi | Rule::Blob => {
            expect_str(&value)?;
            Ok(value)
        }
        Rule::MinValue(n) => {
            if expect_num(&value)? < *n {
                return Err(format!("Value must be at least {n}"));
            }
            Ok(value)
        }
        Rule::MaxValue(n) => {
            if expect_num(&value)? > *n {
                return Err(format!("Value must be at most {n}"));
            }
            Ok(value)
        }
        Rule::Integer => {
            if expect_num(&value)?.fract() != 0.0 {
                return Err("Value must be an integer".to_string());
            }
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builders_do_not_mutate_parent() {
        let base = string().min(2.0);
        let extended = base.max(4.0);
        assert_eq!(base.rules.len(), 1, "parent gained a rule");
        assert_eq!(extended.rules.len(), 2);
    }

    #[test]
    fn test_required_missing_field_fails() {
        let constraint = string().required();
        assert!(constraint.check(None).is_err());
        assert_eq!(string().check(None).unwrap(), None);
    }

    #[test]
    fn test_allow_null_short_circuits() {
        let constraint = string().allow_null().min(3.0);
        assert_eq!(
            constraint.check(Some(&Value::Null)).unwrap(),
            Some(Value::Null)
        );
        assert!(string().min(3.0).check(Some(&Value::Null)).is_err());
    }

    #[test]
    fn test_string_length_rules() {
        let constraint = string().min(2.0).max(4.0);
        assert!(constraint.check(Some(&json!("a"))).is_err());
        assert!(constraint.check(Some(&json!("abcde"))).is_err());
        assert!(constraint.check(Some(&json!("abc"))).is_ok());
        assert!(string().length(3).check(Some(&json!("ab"))).is_err());
    }

    #[test]
    fn test_wrong_primitive_kind() {
        assert!(string().check(Some(&json!(5))).is_err());
        assert!(number().check(Some(&json!("5"))).is_err());
        assert!(boolean().check(Some(&json!(1))).is_err());
        assert!(any().check(Some(&json!({"nested": true}))).is_ok());
    }

    #[test]
    fn test_number_rules() {
        let constraint = number().min(1.0).max(10.0).integer();
        assert!(constraint.check(Some(&json!(0))).is_err());
        assert!(constraint.check(Some(&json!(11))).is_err());
        assert!(constraint.check(Some(&json!(2.5))).is_err());
        assert_eq!(constraint.check(Some(&json!(7))).unwrap(), Some(json!(7)));
    }

    #[test]
    fn test_sanitizers_thread_the_value() {
        let constraint = string().lowercase();
        assert_eq!(
            constraint.check(Some(&json!("MiXeD"))).unwrap(),
            Some(json!("mixed"))
        );
        let shouty = string().uppercase().min(3.0);
        assert_eq!(
            shouty.check(Some(&json!("abc"))).unwrap(),
            Some(json!("ABC"))
        );
    }

    #[test]
    fn test_email_and_alphanum() {
        assert!(string().email().check(Some(&json!("a@b.co"))).is_ok());
        assert!(string().email().check(Some(&json!("not-an-email"))).is_err());
        assert!(string().alphanum().check(Some(&json!("abc123"))).is_ok());
        assert!(string().alphanum().check(Some(&json!("a-b"))).is_err());
    }

    #[test]
    fn test_enumeration() {
        let constraint = string().enumeration(["red", "green"]);
        assert!(constraint.check(Some(&json!("red"))).is_ok());
        assert!(constraint.check(Some(&json!("blue"))).is_err());
    }

    #[test]
    fn test_uuid_versions() {
        let v4 = "9b2f38f5-5b4d-4dc1-9e29-5a54f0a9fbc3";
        assert!(string().uuid(None).check(Some(&json!(v4))).is_ok());
        assert!(string().uuid(Some(4)).check(Some(&json!(v4))).is_ok());
        assert!(string().uuid(Some(1)).check(Some(&json!(v4))).is_err());
        assert!(string().uuid(None).check(Some(&json!("nope"))).is_err());
    }

    #[test]
    fn test_regex_flags() {
        let ci = string().regex("^abc$", Some("i"));
        assert!(ci.check(Some(&json!("ABC"))).is_ok());
        let cs = string().regex("^abc$", None);
        assert!(cs.check(Some(&json!("ABC"))).is_err());
    }

    #[test]
    fn test_invalid_pattern_always_fails() {
        let broken = string().regex("(unclosed", None);
        assert!(broken.check(Some(&json!("anything"))).is_err());
    }

    #[test]
    fn test_multi_marker() {
        let tags = string().multi();
        assert!(tags.is_multi());
        assert!(!string().is_multi());
        assert!(tags.check(Some(&json!("a,b,c"))).is_ok());
    }
}
