//! Classify arbitrary errors into a normalized [`Failure`].
//!
//! Error types from different layers are unrelated, so extraction goes through
//! an explicit registry of adapter functions keyed by concrete type. Any type
//! can join by implementing [`Classifiable`] and being registered.

use std::error::Error;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};

use crate::rpc::RpcError;
use crate::session::PoolError;

use super::failure::{Code, Failure, StatusCode, TransportCode};

/// Upper bound on how deep cause chains and aggregates are followed.
const MAX_DEPTH: usize = 32;
/// Upper bound on errors visited per classification (guards against fan-out).
const MAX_VISITED: usize = 256;

/// Capability implemented by error types that carry a transport or status code.
pub trait Classifiable {
    /// The code carried by this error itself, ignoring its causes.
    fn code(&self) -> Option<Code>;

    /// Member errors of an aggregate. `source()` is followed separately.
    fn nested(&self) -> Vec<&(dyn Error + 'static)> {
        Vec::new()
    }
}

/// What an adapter learned about one error.
#[derive(Debug, Default)]
pub struct Inspection<'e> {
    pub code: Option<Code>,
    pub nested: Vec<&'e (dyn Error + 'static)>,
}

/// Adapter: recognizes one concrete error type behind a trait object.
pub type Adapter = for<'a> fn(&'a (dyn Error + 'static)) -> Option<Inspection<'a>>;

fn inspect_as<'a, E>(err: &'a (dyn Error + 'static)) -> Option<Inspection<'a>>
where
    E: Classifiable + Error + 'static,
{
    err.downcast_ref::<E>().map(|e| Inspection {
        code: e.code(),
        nested: e.nested(),
    })
}

/// Registry of adapters used to turn caught errors into [`Failure`]s.
#[derive(Clone)]
pub struct Classifier {
    adapters: Vec<Adapter>,
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// A classifier that knows this crate's error types and `std::io::Error`.
    pub fn new() -> Self {
        let mut classifier = Self::empty();
        classifier
            .register::<RpcError>()
            .register::<PoolError>()
            .register::<io::Error>();
        classifier
    }

    /// A classifier with no adapters; everything is unclassified.
    pub fn empty() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Register a [`Classifiable`] error type.
    pub fn register<E>(&mut self) -> &mut Self
    where
        E: Classifiable + Error + 'static,
    {
        self.adapters.push(inspect_as::<E>);
        self
    }

    /// Register a free adapter function for a type that cannot implement
    /// [`Classifiable`] directly.
    pub fn register_fn(&mut self, adapter: Adapter) -> &mut Self {
        self.adapters.push(adapter);
        self
    }

    /// Classify `err`. Never panics: a misbehaving adapter yields an
    /// unclassified failure.
    pub fn classify<'a>(&self, err: &'a (dyn Error + 'static)) -> Failure<'a> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.find_codes(err))) {
            Ok((transport, status)) => Failure::new(err, transport, status),
            Err(_) => {
                tracing::warn!(error = %err, "error classifier panicked; treating failure as unclassified");
                Failure::unclassified(err)
            }
        }
    }

    fn inspect<'e>(&self, err: &'e (dyn Error + 'static)) -> Inspection<'e> {
        self.adapters
            .iter()
            .find_map(|adapter| adapter(err))
            .unwrap_or_default()
    }

    /// Depth-first walk over the cause chain and aggregate members.
    ///
    /// The first transport code found wins; the first status code found is
    /// kept alongside it.
    fn find_codes(
        &self,
        root: &(dyn Error + 'static),
    ) -> (Option<TransportCode>, Option<StatusCode>) {
        let mut transport = None;
        let mut status = None;
        let mut visited = 0usize;
        let mut stack: Vec<(&(dyn Error + 'static), usize)> = vec![(root, 0)];

        while let Some((err, depth)) = stack.pop() {
            visited += 1;
            if visited > MAX_VISITED {
                break;
            }

            let inspection = self.inspect(err);
            match inspection.code {
                Some(Code::Transport(code)) => {
                    transport = Some(code);
                    break;
                }
                Some(Code::Status(code)) if status.is_none() => status = Some(code),
                _ => {}
            }

            if depth >= MAX_DEPTH {
                continue;
            }
            // Pushed in reverse so the source is visited before aggregate members.
            for member in inspection.nested.into_iter().rev() {
                stack.push((member, depth + 1));
            }
            if let Some(source) = err.source() {
                stack.push((source, depth + 1));
            }
        }

        (transport, status)
    }
}

impl Classifiable for io::Error {
    fn code(&self) -> Option<Code> {
        use io::ErrorKind;
        let code = match self.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable => TransportCode::Unavailable,
            ErrorKind::TimedOut => TransportCode::DeadlineExceeded,
            ErrorKind::PermissionDenied => TransportCode::PermissionDenied,
            _ => return None,
        };
        Some(Code::Transport(code))
    }

    /// The payload of `io::Error::new(kind, inner)`. `source()` skips it and
    /// reports `inner.source()` instead.
    fn nested(&self) -> Vec<&(dyn Error + 'static)> {
        match self.get_ref() {
            Some(inner) => vec![inner as &(dyn Error + 'static)],
            None => Vec::new(),
        }
    }
}
