//! Path-prefix routing table
//!
//! The table is built once at startup and never mutated, so it is shared
//! between connection tasks behind an `Arc` without locking. Precedence is
//! explicit: the longest matching prefix wins, and among prefixes of equal
//! length the one registered first wins.

use crate::config::{LOCAL_TOOLS_MESSAGE_PATH, LOCAL_TOOLS_SSE_PATH};
use crate::ports::PortAssignment;

/// Host every route forwards to
pub const TARGET_HOST: &str = "localhost";

/// How a route's prefix is compared against the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixMatch {
    /// `/name` matches `/name` and `/name/...`, but not `/names`
    Segment,
    /// Plain string prefix: `/sse` also matches `/sse2`
    Raw,
}

/// What a route points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    /// Adapter fronting a configured backend
    Backend { name: String },
    /// Local tools event stream
    LocalToolsEvents,
    /// Local tools message endpoint
    LocalToolsMessages,
}

/// A path prefix and the target it forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub matching: PrefixMatch,
    pub target_host: String,
    pub target_port: u16,
    /// Remove `prefix` from the path before forwarding
    pub strip_prefix: bool,
    /// Relay `Connection: upgrade` requests on this route
    pub supports_upgrade: bool,
    pub kind: RouteKind,
}

impl Route {
    /// Route for a backend adapter: `/<name>` stripped, upgrades relayed
    pub fn backend(name: &str, port: u16) -> Self {
        Self {
            prefix: format!("/{}", name),
            matching: PrefixMatch::Segment,
            target_host: TARGET_HOST.to_string(),
            target_port: port,
            strip_prefix: true,
            supports_upgrade: true,
            kind: RouteKind::Backend {
                name: name.to_string(),
            },
        }
    }

    /// Route for the local tools event stream, forwarded unchanged
    pub fn local_tools_events(port: u16) -> Self {
        Self {
            prefix: LOCAL_TOOLS_SSE_PATH.to_string(),
            matching: PrefixMatch::Raw,
            target_host: TARGET_HOST.to_string(),
            target_port: port,
            strip_prefix: false,
            supports_upgrade: true,
            kind: RouteKind::LocalToolsEvents,
        }
    }

    /// Route for the local tools message endpoint, forwarded unchanged
    pub fn local_tools_messages(port: u16) -> Self {
        Self {
            prefix: LOCAL_TOOLS_MESSAGE_PATH.to_string(),
            matching: PrefixMatch::Raw,
            target_host: TARGET_HOST.to_string(),
            target_port: port,
            strip_prefix: false,
            supports_upgrade: false,
            kind: RouteKind::LocalToolsMessages,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        match self.matching {
            PrefixMatch::Raw => true,
            PrefixMatch::Segment => rest.is_empty() || rest.starts_with('/'),
        }
    }

    /// Path to send upstream. Only the exact prefix is removed, and an
    /// emptied path becomes `/`.
    pub fn rewrite_path(&self, path: &str) -> String {
        if !self.strip_prefix {
            return path.to_string();
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) => format!("/{}", rest),
            None => path.to_string(),
        }
    }

    /// `host:port` of the target
    pub fn authority(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    pub fn backend_name(&self) -> Option<&str> {
        match &self.kind {
            RouteKind::Backend { name } => Some(name.as_str()),
            _ => None,
        }
    }
}

/// Immutable, ordered set of routes
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Routes in registration order
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// One route per backend in config order, then the two local tools routes
    pub fn build(assignments: &[PortAssignment], local_tools_port: u16) -> Self {
        let mut routes: Vec<Route> = assignments
            .iter()
            .map(|a| Route::backend(&a.spec.name, a.port))
            .collect();
        routes.push(Route::local_tools_events(local_tools_port));
        routes.push(Route::local_tools_messages(local_tools_port));
        Self::new(routes)
    }

    /// Most specific route for `path`: longest prefix, then earliest registered
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        let mut best: Option<&Route> = None;
        for route in self.routes.iter().filter(|r| r.matches(path)) {
            match best {
                Some(current) if current.prefix.len() >= route.prefix.len() => {}
                _ => best = Some(route),
            }
        }
        best
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Backend names in registration order
    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().filter_map(Route::backend_name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
