//! Streaming state: versioned stores, the processor API and the stateful
//! transformation operator.

pub mod processor;
pub mod store;
pub mod transform_with_state;

pub use processor::{
    OutputMode, ProcessorState, StatefulProcessor, StatefulProcessorHandle, TimeMode, TimerValues,
    ValueState,
};
pub use store::{
    FileStateStoreProvider, MemoryStateStoreProvider, StateStore, StateStoreId,
    StateStoreProvider, StoreStatus,
};
pub use transform_with_state::{BatchInfo, InitialState, TransformWithStateExec};
