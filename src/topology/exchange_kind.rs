use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// How an exchange routes messages to the queues bound to it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ExchangeKind {
    /// Exact match on the routing key.
    #[default]
    Direct,
    /// Every bound queue gets a copy, routing keys are ignored.
    Fanout,
    /// Pattern match on dot-separated routing keys (`*` and `#` wildcards).
    Topic,
    /// Match on message headers instead of the routing key.
    Headers,
    /// Provided by the `rabbitmq_delayed_message_exchange` plugin.
    ///
    /// The underlying routing semantics are set via the `x-delayed-type` argument.
    DelayedMessage,
}

impl ExchangeKind {
    /// The exchange type as it travels on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
            Self::DelayedMessage => "x-delayed-message",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("`{0}` is not a supported exchange kind")]
pub struct UnknownExchangeKind(String);

impl FromStr for ExchangeKind {
    type Err = UnknownExchangeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            "x-delayed-message" => Ok(Self::DelayedMessage),
            other => Err(UnknownExchangeKind(other.to_owned())),
        }
    }
}

impl TryFrom<String> for ExchangeKind {
    type Error = UnknownExchangeKind;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::DelayedMessage => lapin::ExchangeKind::Custom(kind.as_str().to_owned()),
        }
    }
}
