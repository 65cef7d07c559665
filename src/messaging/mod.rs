pub mod broker;
pub mod event;
pub mod notifier;

pub use broker::{create_message_broker, LocalBroker, MessageBroker, MessageBrokerTrait};
pub use event::{EventMessage, EventType};
pub use notifier::EventNotifier;
