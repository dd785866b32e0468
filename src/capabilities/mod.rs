mod builtin;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::wire::envelope::{ClientAddress, EntityError, PayloadMap, RequestParams, ServerTag};
use crate::wire::handshake::{HandshakeFlow, UNKNOWN_OPERATION_CODE};

pub use builtin::{
    ConnectionInfoFactory, ContentQueryFactory, ContentStore, GpsStatusFactory,
    LocationUpdatesFactory, NmeaFactory, SentMessage, SmsOutbox, TextMessageFactory,
};

/// One step of a capability's output.
#[derive(Clone, Debug, PartialEq)]
pub enum Production {
    Sample(PayloadMap),
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    UnknownOperation { operation: String },
    InvalidArguments { operation: String, message: String },
    Unavailable {
        operation: String,
        code: String,
        message: String,
    },
    Cancelled,
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperation { operation } => {
                write!(f, "no capability registered for operation '{operation}'")
            }
            Self::InvalidArguments { operation, message } => {
                write!(f, "invalid arguments for '{operation}': {message}")
            }
            Self::Unavailable {
                operation,
                code,
                message,
            } => write!(f, "capability '{operation}' unavailable ({code}): {message}"),
            Self::Cancelled => write!(f, "capability was cancelled"),
        }
    }
}

impl std::error::Error for CapabilityError {}

impl CapabilityError {
    pub fn code(&self) -> &str {
        match self {
            Self::UnknownOperation { .. } => UNKNOWN_OPERATION_CODE,
            Self::InvalidArguments { .. } => "InvalidArguments",
            Self::Unavailable { code, .. } => code,
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn to_entity_error(&self) -> EntityError {
        EntityError::new(self.code(), self.to_string())
    }
}

/// A running privileged operation for one client.
///
/// Implementations must tolerate `authorize` being called again after a restart, and `cancel`
/// must be idempotent and wake any blocked `produce_next`.
pub trait CapabilityHandle: Send + Sync {
    /// One-shot capabilities return their resource here; streams and content reads return `None`.
    fn authorize(&self) -> Result<Option<PayloadMap>, CapabilityError>;
    /// May block until the next sample is available.
    fn produce_next(&self) -> Result<Production, CapabilityError>;
    fn cancel(&self);
}

pub trait CapabilityFactory: Send + Sync {
    fn operation(&self) -> &str;
    fn flow(&self) -> HandshakeFlow;
    /// Service tag stamped on resource responses.
    fn server_tag(&self) -> ServerTag;
    fn create(
        &self,
        client_address: Option<&ClientAddress>,
        params: &RequestParams,
    ) -> Result<Arc<dyn CapabilityHandle>, CapabilityError>;
}

/// Operation code to capability factory.
#[derive(Default)]
pub struct CapabilityRegistry {
    factories: HashMap<String, Arc<dyn CapabilityFactory>>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("operations", &self.operations())
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every simulated provider wired to the given content store and outbox.
    pub fn with_builtins(content: ContentStore, outbox: SmsOutbox) -> Self {
        let mut registry = Self::new();
        registry.register(ConnectionInfoFactory);
        registry.register(TextMessageFactory::new(outbox));
        registry.register(LocationUpdatesFactory);
        registry.register(GpsStatusFactory);
        registry.register(NmeaFactory);
        registry.register(ContentQueryFactory::new(content));
        registry
    }

    /// Registers a factory, replacing any previous one for the same operation.
    pub fn register<F>(&mut self, factory: F) -> Option<Arc<dyn CapabilityFactory>>
    where
        F: CapabilityFactory + 'static,
    {
        let operation = factory.operation().to_owned();
        self.factories.insert(operation, Arc::new(factory))
    }

    pub fn resolve(&self, operation: &str) -> Result<Arc<dyn CapabilityFactory>, CapabilityError> {
        self.factories
            .get(operation)
            .cloned()
            .ok_or_else(|| CapabilityError::UnknownOperation {
                operation: operation.to_owned(),
            })
    }

    pub fn operations(&self) -> Vec<String> {
        let mut operations: Vec<String> = self.factories.keys().cloned().collect();
        operations.sort();
        operations
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::envelope::ServerTag;
    use crate::wire::handshake::HandshakeFlow;

    use super::{CapabilityError, CapabilityRegistry, ContentStore, SmsOutbox};

    #[test]
    fn builtins_cover_every_flow() {
        let registry = CapabilityRegistry::with_builtins(ContentStore::default(), SmsOutbox::default());

        assert_eq!(
            registry.operations(),
            vec![
                "AddGpsStatusListener",
                "AddNmeaListener",
                "GetConnectionInfo",
                "Query",
                "RequestLocationUpdates",
                "SendTextMessage",
            ]
        );

        let location = registry
            .resolve("RequestLocationUpdates")
            .expect("location capability should resolve");
        assert_eq!(location.flow(), HandshakeFlow::Ongoing);
        assert_eq!(location.server_tag(), ServerTag::LocationService);

        let query = registry.resolve("Query").expect("query capability should resolve");
        assert_eq!(query.flow(), HandshakeFlow::Content);
        assert_eq!(query.server_tag(), ServerTag::ContentProvider);
    }

    #[test]
    fn unknown_operation_maps_to_its_error_code() {
        let registry = CapabilityRegistry::new();
        let err = registry
            .resolve("Teleport")
            .err()
            .expect("empty registry resolves nothing");

        assert!(matches!(err, CapabilityError::UnknownOperation { .. }));
        let entity = err.to_entity_error();
        assert_eq!(entity.code, "UnknownOperation");
        assert!(entity.message.contains("Teleport"));
    }

    #[test]
    fn unavailable_errors_carry_capability_specific_codes() {
        let err = CapabilityError::Unavailable {
            operation: "Query".to_owned(),
            code: "NoSuchContent".to_owned(),
            message: "nothing at content://contacts".to_owned(),
        };
        assert_eq!(err.code(), "NoSuchContent");
    }
}
