//! Command invocation: an ordered argument list plus the per-call overrides
//! a [`crate::router::Router`] and [`crate::connection::Connection`] honor.

use crate::resp::{Argument, TextEncoding};

/// How a bulk-string reply's bytes should be decoded back to text. Only
/// "leave as raw bytes" (the default) and UTF-8 lossy are implemented for
/// now; the per-call `decoder` override is the extension point for more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyDecoding {
    #[default]
    RawBytes,
    Utf8Lossy,
}

/// Which endpoint a call should be routed to, overriding automatic routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSelector {
    /// Automatic routing by key/command (the default).
    Auto,
    /// A concrete `host:port` or Unix path.
    Address(String),
    Leader,
    Replica,
    Sentinel,
    /// Cluster fan-out across every master/leader endpoint.
    Masters,
}

impl Default for EndpointSelector {
    fn default() -> Self {
        EndpointSelector::Auto
    }
}

/// Per-call overrides recognized by the router and connection layer (§6).
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub encoding: TextEncoding,
    pub decoding: ReplyDecoding,
    /// Wrap replies with their RESP3 attributes when true.
    pub attributes: bool,
    /// Per-call `SELECT` issued before the command.
    pub database: Option<u64>,
    pub endpoint: EndpointSelector,
    /// Prefix the command with `ASKING` (used internally by the cluster
    /// router's one-shot `ASK` retry, but may also be set explicitly).
    pub asking: bool,
}

/// One command: an ordered list of arguments ready for the encoder.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub args: Vec<Argument>,
}

impl Command {
    pub fn new(name: impl Into<Argument>) -> Self {
        Command { args: vec![name.into()] }
    }

    pub fn arg(mut self, arg: impl Into<Argument>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        match self.args.first() {
            Some(Argument::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Command name, upper-cased, for taxonomy lookups (reserved-push set,
    /// command-info cache, `SELECT` detection).
    pub fn name_uppercase(&self) -> Option<String> {
        self.name().map(|s| s.to_ascii_uppercase())
    }
}

/// A request to the connection layer: either one command or a pipeline of
/// several, carrying one shared set of [`CallOptions`].
#[derive(Debug, Clone)]
pub enum Invocation {
    Single(Command),
    Pipeline(Vec<Command>),
}

impl Invocation {
    pub fn commands(&self) -> &[Command] {
        match self {
            Invocation::Single(c) => std::slice::from_ref(c),
            Invocation::Pipeline(cs) => cs,
        }
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self, Invocation::Pipeline(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_name_is_case_normalized() {
        let cmd = Command::new("get").arg("k");
        assert_eq!(cmd.name(), Some("get"));
        assert_eq!(cmd.name_uppercase(), Some("GET".to_string()));
    }
}
