//! nimbus-pipeline — the media pipeline abstraction jobs run on.
//!
//! Provides the fixed operation set a feed component needs: a
//! pipeline state machine with a typed bus, pads with probes and
//! blocking, an fd source and multi-client fd sink speaking the feed
//! wire format, a discontinuity monitor, element property coercion,
//! and the network clock machinery for master-clock election.
//!
//! Codec elements are out of scope; the component-specific graph
//! between eaters and feeders is whatever chain functions the
//! component links together.

pub mod buffer;
pub mod bus;
pub mod clock;
pub mod discont;
pub mod error;
pub mod fdsink;
pub mod fdsource;
pub mod pad;
pub mod pipeline;
pub mod props;
pub mod wire;

pub use buffer::{Buffer, FeedItem, StreamEvent};
pub use bus::{Bus, BusMessage, BusSender, ElementMessage};
pub use clock::{system_now_ns, ClockSource, NetClientClock, NetTimeProvider};
pub use discont::DiscontMonitor;
pub use error::{PipelineError, PipelineResult};
pub use fdsink::{FdSink, FdStats};
pub use fdsource::FdSource;
pub use pad::{ChainFn, Pad, ProbeAction, ProbeFn, ProbeId, ProbeKind};
pub use pipeline::{Pipeline, PipelineState};
pub use props::{PropertyKind, PropertySpec, PropertyTable, PropertyValue};
