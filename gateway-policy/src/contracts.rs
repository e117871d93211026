//! Request facts presented to the evaluator and the decision engine.

use std::fmt::{self, Display, Formatter};

use gateway_primitives::TenantId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of the caller on whose behalf the request runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    /// User identifier.
    #[serde(default)]
    pub id: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
    /// Role name, e.g. `admin`.
    #[serde(default)]
    pub role: String,
    /// Department or team.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    /// Granted permissions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Tenant the user belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl UserContext {
    fn fact(&self, attr: &str) -> FactValue {
        match attr {
            "id" => FactValue::text(&self.id),
            "email" => FactValue::text(&self.email),
            "role" => FactValue::text(&self.role),
            "department" => self
                .department
                .as_deref()
                .map_or(FactValue::Absent, FactValue::text),
            "tenant_id" => self
                .tenant_id
                .as_deref()
                .map_or(FactValue::Absent, FactValue::text),
            "permissions" => FactValue::Sequence(
                self.permissions
                    .iter()
                    .map(|p| FactValue::String(p.clone()))
                    .collect(),
            ),
            _ => FactValue::Absent,
        }
    }
}

/// Value of a request fact.
///
/// The evaluator is total over this union; [`FactValue::Absent`] stands for
/// a field the request does not carry.
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    /// The request has no value at this address.
    Absent,
    /// Textual value.
    String(String),
    /// Numeric value.
    Number(f64),
    /// Boolean value.
    Bool(bool),
    /// Ordered list of values.
    Sequence(Vec<FactValue>),
}

impl FactValue {
    fn text(text: &str) -> Self {
        Self::String(text.to_owned())
    }

    /// Returns true when the request does not carry the fact.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// String form used by every comparison; `None` when absent.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Absent => None,
            _ => Some(self.to_string()),
        }
    }
}

impl Display for FactValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => Ok(()),
            Self::String(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{}", render_number(*number)),
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Sequence(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(" ")?;
                    }
                    Display::fmt(item, f)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&Value> for FactValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Absent,
            Value::String(text) => Self::String(text.clone()),
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => number.as_f64().map_or(Self::Absent, Self::Number),
            Value::Array(items) => Self::Sequence(items.iter().map(Self::from).collect()),
            Value::Object(_) => Self::String(value.to_string()),
        }
    }
}

/// Renders integral numbers without a fractional part.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn render_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 9.007_199_254_740_992e15 {
        format!("{}", number as i64)
    } else {
        format!("{number}")
    }
}

/// Full request presented to policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRequest {
    tenant_id: TenantId,
    query: String,
    #[serde(default)]
    request_type: String,
    #[serde(default)]
    user: UserContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    context: Map<String, Value>,
}

impl PolicyRequest {
    /// Creates a request for the tenant with the given query text.
    #[must_use]
    pub fn new(tenant_id: TenantId, query: impl Into<String>) -> Self {
        Self {
            tenant_id,
            query: query.into(),
            request_type: String::new(),
            user: UserContext::default(),
            client_id: None,
            context: Map::new(),
        }
    }

    /// Sets the request type, e.g. `llm_chat` or `sql`.
    #[must_use]
    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }

    /// Attaches the calling user.
    #[must_use]
    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = user;
        self
    }

    /// Attaches the calling client application.
    #[must_use]
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Adds a context entry addressable as `context.<key>`.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Replaces the whole context map.
    #[must_use]
    pub fn with_context_map(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Owning tenant.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Query text.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Request type label.
    #[must_use]
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// Calling user.
    #[must_use]
    pub fn user(&self) -> &UserContext {
        &self.user
    }

    /// Calling client, when known.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Free-form context entries.
    #[must_use]
    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    /// Returns true for `query`, `request_type`, `user.<attr>` and `context.<key>`.
    #[must_use]
    pub fn is_addressable(field: &str) -> bool {
        matches!(field, "query" | "request_type")
            || field.starts_with("user.")
            || field.starts_with("context.")
    }

    /// Resolves a condition field address to a fact.
    ///
    /// Literal fields always resolve, empty or not. Missing namespaced
    /// attributes and unaddressable fields resolve to [`FactValue::Absent`].
    #[must_use]
    pub fn fact(&self, field: &str) -> FactValue {
        match field {
            "query" => FactValue::text(&self.query),
            "request_type" => FactValue::text(&self.request_type),
            _ => {
                if let Some(attr) = field.strip_prefix("user.") {
                    self.user.fact(attr)
                } else if let Some(key) = field.strip_prefix("context.") {
                    self.context.get(key).map_or(FactValue::Absent, FactValue::from)
                } else {
                    FactValue::Absent
                }
            }
        }
    }
}
