//! Request attribute snapshot.

use std::net::{IpAddr, Ipv4Addr};

/// The attributes of one request that throttling decisions look at.
///
/// Built by the request-handling layer once the client address has been
/// resolved; not retained after the decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// HTTP method, e.g. `GET`
    pub method: String,
    /// Request path, e.g. `/home/index/5`
    pub path: String,
    /// All values of the `User-Agent` header, empty when absent
    pub user_agent: Vec<String>,
    /// The resolved client address
    pub client_address: IpAddr,
    /// Handler group serving the request, if known
    pub controller_name: Option<String>,
    /// Handler serving the request, if known
    pub action_name: Option<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>, client_address: IpAddr) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            user_agent: Vec::new(),
            client_address,
            controller_name: None,
            action_name: None,
        }
    }

    /// Add a `User-Agent` header value.
    pub fn with_user_agent(mut self, value: impl Into<String>) -> Self {
        self.user_agent.push(value.into());
        self
    }

    pub fn with_controller(mut self, name: impl Into<String>) -> Self {
        self.controller_name = Some(name.into());
        self
    }

    pub fn with_action(mut self, name: impl Into<String>) -> Self {
        self.action_name = Some(name.into());
        self
    }

    /// The `User-Agent` header, multiple values joined by `,`.
    ///
    /// `None` when the header is absent.
    pub fn user_agent(&self) -> Option<String> {
        if self.user_agent.is_empty() {
            None
        } else {
            Some(self.user_agent.join(","))
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new("GET", "/", IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}
