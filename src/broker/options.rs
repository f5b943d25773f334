use std::fmt;

use serde::Deserialize;

use crate::message::OutboxOptions;

pub const DEFAULT_POOL_SIZE: usize = 15;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// Where the broker lives and how messages are routed on it.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    pub publish_confirms: bool,
    pub pool_size: usize,
    pub outbox: OutboxOptions,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: String::new(),
            exchange_name: "outbox.default.router".to_string(),
            exchange_kind: ExchangeKind::Topic,
            publish_confirms: false,
            pool_size: DEFAULT_POOL_SIZE,
            outbox: OutboxOptions::default(),
        }
    }
}

impl BrokerOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn with_exchange(mut self, name: impl Into<String>, kind: ExchangeKind) -> Self {
        self.exchange_name = name.into();
        self.exchange_kind = kind;
        self
    }

    pub fn with_publish_confirms(mut self, enabled: bool) -> Self {
        self.publish_confirms = enabled;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_outbox(mut self, outbox: OutboxOptions) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn connection_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.virtual_host
        )
    }

    /// Exchange actually declared and published to. Non-default protocol
    /// versions get their own exchange so old and new consumers don't mix.
    pub fn effective_exchange(&self) -> String {
        if self.outbox.is_default_version() {
            self.exchange_name.clone()
        } else {
            format!("{}.{}", self.exchange_name, self.outbox.version)
        }
    }
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("virtual_host", &self.virtual_host)
            .field("exchange_name", &self.exchange_name)
            .field("exchange_kind", &self.exchange_kind)
            .field("publish_confirms", &self.publish_confirms)
            .field("pool_size", &self.pool_size)
            .field("outbox", &self.outbox)
            .finish()
    }
}
