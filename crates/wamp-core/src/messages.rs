//! WAMP v2 message model.
//!
//! Every message travels as a list whose first element is the numeric type
//! code. Field order below is the wire order and must not change.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{WampError, WampResult};

/// Protocol identifiers (session, request, registration, ...), all in `[0, 2^53]`.
pub type Id = u64;
/// Dictionary payloads (details, options, keyword arguments).
pub type Dict = Map<String, Value>;
/// Positional argument list.
pub type List = Vec<Value>;

/// Largest id value a peer may use (2^53, the JavaScript safe-integer limit).
pub const MAX_ID: Id = 1 << 53;

/// Well-known reason and error URIs.
pub mod uris {
    pub const CLOSE_NORMAL: &str = "wamp.close.normal";
    pub const CLOSE_GOODBYE_AND_OUT: &str = "wamp.close.goodbye_and_out";
    pub const CLOSE_SYSTEM_SHUTDOWN: &str = "wamp.close.system_shutdown";
    pub const CLOSE_TRANSPORT_LOST: &str = "wamp.close.transport_lost";

    pub const ERROR_NO_SUCH_REGISTRATION: &str = "wamp.error.no_such_registration";
    pub const ERROR_NO_SUCH_SUBSCRIPTION: &str = "wamp.error.no_such_subscription";
    pub const ERROR_RUNTIME: &str = "wamp.error.runtime_error";
    pub const ERROR_NO_AUTH_METHOD: &str = "wamp.error.no_auth_method";
    pub const ERROR_AUTHENTICATION_FAILED: &str = "wamp.error.authentication_failed";
    pub const ERROR_PROTOCOL_VIOLATION: &str = "wamp.error.protocol_violation";
}

/// Numeric message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageType {
    Hello = 1,
    Welcome = 2,
    Abort = 3,
    Challenge = 4,
    Authenticate = 5,
    Goodbye = 6,
    Error = 8,
    Publish = 16,
    Published = 17,
    Subscribe = 32,
    Subscribed = 33,
    Unsubscribe = 34,
    Unsubscribed = 35,
    Event = 36,
    Call = 48,
    Result = 50,
    Register = 64,
    Registered = 65,
    Unregister = 66,
    Unregistered = 67,
    Invocation = 68,
    Yield = 70,
}

impl From<MessageType> for u64 {
    fn from(m: MessageType) -> u64 {
        m as u64
    }
}

impl TryFrom<u64> for MessageType {
    type Error = WampError;

    fn try_from(v: u64) -> Result<Self, WampError> {
        match v {
            1 => Ok(Self::Hello),
            2 => Ok(Self::Welcome),
            3 => Ok(Self::Abort),
            4 => Ok(Self::Challenge),
            5 => Ok(Self::Authenticate),
            6 => Ok(Self::Goodbye),
            8 => Ok(MessageType::Error),
            16 => Ok(Self::Publish),
            17 => Ok(Self::Published),
            32 => Ok(Self::Subscribe),
            33 => Ok(Self::Subscribed),
            34 => Ok(Self::Unsubscribe),
            35 => Ok(Self::Unsubscribed),
            36 => Ok(Self::Event),
            48 => Ok(Self::Call),
            50 => Ok(Self::Result),
            64 => Ok(Self::Register),
            65 => Ok(Self::Registered),
            66 => Ok(Self::Unregister),
            67 => Ok(Self::Unregistered),
            68 => Ok(Self::Invocation),
            70 => Ok(Self::Yield),
            _ => Err(WampError::Protocol(format!("unknown message type: {v}"))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hello => "HELLO",
            Self::Welcome => "WELCOME",
            Self::Abort => "ABORT",
            Self::Challenge => "CHALLENGE",
            Self::Authenticate => "AUTHENTICATE",
            Self::Goodbye => "GOODBYE",
            Self::Error => "ERROR",
            Self::Publish => "PUBLISH",
            Self::Published => "PUBLISHED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Subscribed => "SUBSCRIBED",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsubscribed => "UNSUBSCRIBED",
            Self::Event => "EVENT",
            Self::Call => "CALL",
            Self::Result => "RESULT",
            Self::Register => "REGISTER",
            Self::Registered => "REGISTERED",
            Self::Unregister => "UNREGISTER",
            Self::Unregistered => "UNREGISTERED",
            Self::Invocation => "INVOCATION",
            Self::Yield => "YIELD",
        };
        f.write_str(name)
    }
}

/// A single WAMP message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello {
        realm: String,
        details: Dict,
    },
    Welcome {
        session: Id,
        details: Dict,
    },
    Abort {
        details: Dict,
        reason: String,
    },
    Challenge {
        auth_method: String,
        extra: Dict,
    },
    Authenticate {
        signature: String,
        extra: Dict,
    },
    Goodbye {
        details: Dict,
        reason: String,
    },
    Error {
        request_type: MessageType,
        request: Id,
        details: Dict,
        error: String,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Publish {
        request: Id,
        options: Dict,
        topic: String,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Published {
        request: Id,
        publication: Id,
    },
    Subscribe {
        request: Id,
        options: Dict,
        topic: String,
    },
    Subscribed {
        request: Id,
        subscription: Id,
    },
    Unsubscribe {
        request: Id,
        subscription: Id,
    },
    Unsubscribed {
        request: Id,
        details: Option<Dict>,
    },
    Event {
        subscription: Id,
        publication: Id,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Call {
        request: Id,
        options: Dict,
        procedure: String,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Result {
        request: Id,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Register {
        request: Id,
        options: Dict,
        procedure: String,
    },
    Registered {
        request: Id,
        registration: Id,
    },
    Unregister {
        request: Id,
        registration: Id,
    },
    Unregistered {
        request: Id,
        details: Option<Dict>,
    },
    Invocation {
        request: Id,
        registration: Id,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
    Yield {
        request: Id,
        options: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    },
}

impl Message {
    /// The type code of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hello { .. } => MessageType::Hello,
            Self::Welcome { .. } => MessageType::Welcome,
            Self::Abort { .. } => MessageType::Abort,
            Self::Challenge { .. } => MessageType::Challenge,
            Self::Authenticate { .. } => MessageType::Authenticate,
            Self::Goodbye { .. } => MessageType::Goodbye,
            Self::Error { .. } => MessageType::Error,
            Self::Publish { .. } => MessageType::Publish,
            Self::Published { .. } => MessageType::Published,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Subscribed { .. } => MessageType::Subscribed,
            Self::Unsubscribe { .. } => MessageType::Unsubscribe,
            Self::Unsubscribed { .. } => MessageType::Unsubscribed,
            Self::Event { .. } => MessageType::Event,
            Self::Call { .. } => MessageType::Call,
            Self::Result { .. } => MessageType::Result,
            Self::Register { .. } => MessageType::Register,
            Self::Registered { .. } => MessageType::Registered,
            Self::Unregister { .. } => MessageType::Unregister,
            Self::Unregistered { .. } => MessageType::Unregistered,
            Self::Invocation { .. } => MessageType::Invocation,
            Self::Yield { .. } => MessageType::Yield,
        }
    }

    /// Render the message as its wire list.
    pub fn to_list(&self) -> List {
        let mut out: List = vec![Value::from(u64::from(self.message_type()))];
        match self {
            Self::Hello { realm, details } => {
                out.push(Value::from(realm.as_str()));
                out.push(Value::Object(details.clone()));
            }
            Self::Welcome { session, details } => {
                out.push(Value::from(*session));
                out.push(Value::Object(details.clone()));
            }
            Self::Abort { details, reason } | Self::Goodbye { details, reason } => {
                out.push(Value::Object(details.clone()));
                out.push(Value::from(reason.as_str()));
            }
            Self::Challenge { auth_method, extra } => {
                out.push(Value::from(auth_method.as_str()));
                out.push(Value::Object(extra.clone()));
            }
            Self::Authenticate { signature, extra } => {
                out.push(Value::from(signature.as_str()));
                out.push(Value::Object(extra.clone()));
            }
            Self::Error {
                request_type,
                request,
                details,
                error,
                args,
                kwargs,
            } => {
                out.push(Value::from(u64::from(*request_type)));
                out.push(Value::from(*request));
                out.push(Value::Object(details.clone()));
                out.push(Value::from(error.as_str()));
                push_payload(&mut out, args, kwargs);
            }
            Self::Publish {
                request,
                options,
                topic,
                args,
                kwargs,
            } => {
                out.push(Value::from(*request));
                out.push(Value::Object(options.clone()));
                out.push(Value::from(topic.as_str()));
                push_payload(&mut out, args, kwargs);
            }
            Self::Published {
                request,
                publication,
            } => {
                out.push(Value::from(*request));
                out.push(Value::from(*publication));
            }
            Self::Subscribe {
                request,
                options,
                topic,
            } => {
                out.push(Value::from(*request));
                out.push(Value::Object(options.clone()));
                out.push(Value::from(topic.as_str()));
            }
            Self::Subscribed {
                request,
                subscription,
            }
            | Self::Unsubscribe {
                request,
                subscription,
            } => {
                out.push(Value::from(*request));
                out.push(Value::from(*subscription));
            }
            Self::Unsubscribed { request, details } | Self::Unregistered { request, details } => {
                out.push(Value::from(*request));
                if let Some(details) = details {
                    out.push(Value::Object(details.clone()));
                }
            }
            Self::Event {
                subscription,
                publication,
                details,
                args,
                kwargs,
            } => {
                out.push(Value::from(*subscription));
                out.push(Value::from(*publication));
                out.push(Value::Object(details.clone()));
                push_payload(&mut out, args, kwargs);
            }
            Self::Call {
                request,
                options,
                procedure,
                args,
                kwargs,
            } => {
                out.push(Value::from(*request));
                out.push(Value::Object(options.clone()));
                out.push(Value::from(procedure.as_str()));
                push_payload(&mut out, args, kwargs);
            }
            Self::Result {
                request,
                details,
                args,
                kwargs,
            } => {
                out.push(Value::from(*request));
                out.push(Value::Object(details.clone()));
                push_payload(&mut out, args, kwargs);
            }
            Self::Register {
                request,
                options,
                procedure,
            } => {
                out.push(Value::from(*request));
                out.push(Value::Object(options.clone()));
                out.push(Value::from(procedure.as_str()));
            }
            Self::Registered {
                request,
                registration,
            }
            | Self::Unregister {
                request,
                registration,
            } => {
                out.push(Value::from(*request));
                out.push(Value::from(*registration));
            }
            Self::Invocation {
                request,
                registration,
                details,
                args,
                kwargs,
            } => {
                out.push(Value::from(*request));
                out.push(Value::from(*registration));
                out.push(Value::Object(details.clone()));
                push_payload(&mut out, args, kwargs);
            }
            Self::Yield {
                request,
                options,
                args,
                kwargs,
            } => {
                out.push(Value::from(*request));
                out.push(Value::Object(options.clone()));
                push_payload(&mut out, args, kwargs);
            }
        }
        out
    }

    /// Parse a wire list into a message.
    pub fn from_list(list: List) -> WampResult<Self> {
        let mut fields = Fields::new(list)?;
        let message = match fields.kind {
            MessageType::Hello => Self::Hello {
                realm: fields.string("Realm")?,
                details: fields.dict("Details")?,
            },
            MessageType::Welcome => Self::Welcome {
                session: fields.id("Session")?,
                details: fields.dict("Details")?,
            },
            MessageType::Abort => Self::Abort {
                details: fields.dict("Details")?,
                reason: fields.string("Reason")?,
            },
            MessageType::Challenge => Self::Challenge {
                auth_method: fields.string("AuthMethod")?,
                extra: fields.dict("Extra")?,
            },
            MessageType::Authenticate => Self::Authenticate {
                signature: fields.string("Signature")?,
                extra: fields.dict("Extra")?,
            },
            MessageType::Goodbye => Self::Goodbye {
                details: fields.dict("Details")?,
                reason: fields.string("Reason")?,
            },
            MessageType::Error => {
                let request_type = MessageType::try_from(fields.id("Request.Type")?)?;
                let request = fields.id("Request")?;
                let details = fields.dict("Details")?;
                let error = fields.string("Error")?;
                let (args, kwargs) = fields.payload()?;
                Self::Error {
                    request_type,
                    request,
                    details,
                    error,
                    args,
                    kwargs,
                }
            }
            MessageType::Publish => {
                let request = fields.id("Request")?;
                let options = fields.dict("Options")?;
                let topic = fields.string("Topic")?;
                let (args, kwargs) = fields.payload()?;
                Self::Publish {
                    request,
                    options,
                    topic,
                    args,
                    kwargs,
                }
            }
            MessageType::Published => Self::Published {
                request: fields.id("Request")?,
                publication: fields.id("Publication")?,
            },
            MessageType::Subscribe => Self::Subscribe {
                request: fields.id("Request")?,
                options: fields.dict("Options")?,
                topic: fields.string("Topic")?,
            },
            MessageType::Subscribed => Self::Subscribed {
                request: fields.id("Request")?,
                subscription: fields.id("Subscription")?,
            },
            MessageType::Unsubscribe => Self::Unsubscribe {
                request: fields.id("Request")?,
                subscription: fields.id("Subscription")?,
            },
            MessageType::Unsubscribed => Self::Unsubscribed {
                request: fields.id("Request")?,
                details: fields.optional_dict("Details")?,
            },
            MessageType::Event => {
                let subscription = fields.id("Subscription")?;
                let publication = fields.id("Publication")?;
                let details = fields.dict("Details")?;
                let (args, kwargs) = fields.payload()?;
                Self::Event {
                    subscription,
                    publication,
                    details,
                    args,
                    kwargs,
                }
            }
            MessageType::Call => {
                let request = fields.id("Request")?;
                let options = fields.dict("Options")?;
                let procedure = fields.string("Procedure")?;
                let (args, kwargs) = fields.payload()?;
                Self::Call {
                    request,
                    options,
                    procedure,
                    args,
                    kwargs,
                }
            }
            MessageType::Result => {
                let request = fields.id("Request")?;
                let details = fields.dict("Details")?;
                let (args, kwargs) = fields.payload()?;
                Self::Result {
                    request,
                    details,
                    args,
                    kwargs,
                }
            }
            MessageType::Register => Self::Register {
                request: fields.id("Request")?,
                options: fields.dict("Options")?,
                procedure: fields.string("Procedure")?,
            },
            MessageType::Registered => Self::Registered {
                request: fields.id("Request")?,
                registration: fields.id("Registration")?,
            },
            MessageType::Unregister => Self::Unregister {
                request: fields.id("Request")?,
                registration: fields.id("Registration")?,
            },
            MessageType::Unregistered => Self::Unregistered {
                request: fields.id("Request")?,
                details: fields.optional_dict("Details")?,
            },
            MessageType::Invocation => {
                let request = fields.id("Request")?;
                let registration = fields.id("Registration")?;
                let details = fields.dict("Details")?;
                let (args, kwargs) = fields.payload()?;
                Self::Invocation {
                    request,
                    registration,
                    details,
                    args,
                    kwargs,
                }
            }
            MessageType::Yield => {
                let request = fields.id("Request")?;
                let options = fields.dict("Options")?;
                let (args, kwargs) = fields.payload()?;
                Self::Yield {
                    request,
                    options,
                    args,
                    kwargs,
                }
            }
        };
        Ok(message)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_list().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list = List::deserialize(deserializer)?;
        Message::from_list(list).map_err(de::Error::custom)
    }
}

/// Convert a JSON object value into a [`Dict`]; anything else yields an empty dict.
pub fn to_dict(value: Value) -> Dict {
    match value {
        Value::Object(map) => map,
        _ => Dict::new(),
    }
}

/// Append the optional `Args`/`KwArgs` tail.
///
/// `Args` must be present (possibly empty) whenever `KwArgs` is.
fn push_payload(out: &mut List, args: &Option<List>, kwargs: &Option<Dict>) {
    match (args, kwargs) {
        (_, Some(kwargs)) => {
            out.push(Value::Array(args.clone().unwrap_or_default()));
            out.push(Value::Object(kwargs.clone()));
        }
        (Some(args), None) => out.push(Value::Array(args.clone())),
        (None, None) => {}
    }
}

/// Positional reader over the elements of a wire list.
struct Fields {
    kind: MessageType,
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(list: List) -> WampResult<Self> {
        let mut items = list.into_iter();
        let code = items
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| WampError::Protocol("message must start with a type code".into()))?;
        let kind = MessageType::try_from(code)?;
        Ok(Self { kind, items })
    }

    fn next(&mut self, field: &str) -> WampResult<Value> {
        self.items
            .next()
            .ok_or_else(|| WampError::Protocol(format!("{} is missing {field}", self.kind)))
    }

    fn invalid(&self, field: &str) -> WampError {
        WampError::Protocol(format!("{} has an invalid {field}", self.kind))
    }

    fn id(&mut self, field: &str) -> WampResult<Id> {
        let value = self.next(field)?;
        match value.as_u64() {
            Some(id) if id <= MAX_ID => Ok(id),
            _ => Err(self.invalid(field)),
        }
    }

    fn string(&mut self, field: &str) -> WampResult<String> {
        match self.next(field)? {
            Value::String(s) => Ok(s),
            _ => Err(self.invalid(field)),
        }
    }

    fn dict(&mut self, field: &str) -> WampResult<Dict> {
        match self.next(field)? {
            Value::Object(map) => Ok(map),
            _ => Err(self.invalid(field)),
        }
    }

    fn optional_dict(&mut self, field: &str) -> WampResult<Option<Dict>> {
        match self.items.next() {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(self.invalid(field)),
        }
    }

    fn payload(&mut self) -> WampResult<(Option<List>, Option<Dict>)> {
        let args = match self.items.next() {
            None => return Ok((None, None)),
            Some(Value::Array(args)) => args,
            Some(_) => return Err(self.invalid("Arguments")),
        };
        let kwargs = match self.items.next() {
            None => None,
            Some(Value::Object(kwargs)) => Some(kwargs),
            Some(_) => return Err(self.invalid("ArgumentsKw")),
        };
        Ok((Some(args), kwargs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(message: &Message) -> Value {
        Value::Array(message.to_list())
    }

    #[test]
    fn hello_field_order() {
        let hello = Message::Hello {
            realm: "realm1".into(),
            details: to_dict(json!({"roles": {"caller": {}}})),
        };
        assert_eq!(wire(&hello), json!([1, "realm1", {"roles": {"caller": {}}}]));
    }

    #[test]
    fn error_carries_request_type_code() {
        let error = Message::Error {
            request_type: MessageType::Invocation,
            request: 7,
            details: Dict::new(),
            error: uris::ERROR_NO_SUCH_REGISTRATION.into(),
            args: None,
            kwargs: None,
        };
        assert_eq!(
            wire(&error),
            json!([8, 68, 7, {}, "wamp.error.no_such_registration"])
        );
    }

    #[test]
    fn kwargs_without_args_emits_empty_args() {
        let call = Message::Call {
            request: 1,
            options: Dict::new(),
            procedure: "com.example.add2".into(),
            args: None,
            kwargs: Some(to_dict(json!({"a": 1}))),
        };
        assert_eq!(
            wire(&call),
            json!([48, 1, {}, "com.example.add2", [], {"a": 1}])
        );
    }

    #[test]
    fn parse_result_with_args() {
        let msg = Message::from_list(vec![json!(50), json!(3), json!({}), json!([5])]).unwrap();
        assert_eq!(
            msg,
            Message::Result {
                request: 3,
                details: Dict::new(),
                args: Some(vec![json!(5)]),
                kwargs: None,
            }
        );
    }

    #[test]
    fn parse_unregistered_with_revocation_details() {
        let msg = Message::from_list(vec![
            json!(67),
            json!(0),
            json!({"registration": 42, "reason": "wamp.close.killed"}),
        ])
        .unwrap();
        match msg {
            Message::Unregistered { request, details } => {
                assert_eq!(request, 0);
                assert_eq!(details.unwrap()["registration"], json!(42));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_code_rejected() {
        let err = Message::from_list(vec![json!(99), json!(1)]).unwrap_err();
        assert!(matches!(err, WampError::Protocol(_)));
    }

    #[test]
    fn missing_field_rejected() {
        let err = Message::from_list(vec![json!(65), json!(1)]).unwrap_err();
        assert!(err.to_string().contains("Registration"));
    }

    #[test]
    fn id_above_limit_rejected() {
        let err = Message::from_list(vec![json!(2), json!(MAX_ID + 1), json!({})]).unwrap_err();
        assert!(matches!(err, WampError::Protocol(_)));
    }

    #[test]
    fn type_code_conversion() {
        assert_eq!(u64::from(MessageType::Yield), 70);
        assert_eq!(MessageType::try_from(36).unwrap(), MessageType::Event);
        assert_eq!(MessageType::Invocation.to_string(), "INVOCATION");
    }
}
