pub mod event_models;

pub use event_models::{
    ArchivedCopy, Event, EventCategory, EventDb, EventFilter, NativeKey, NewEvent,
};
