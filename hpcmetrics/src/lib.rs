// This library holds the data model and the source-independent machinery of the HPC reporter: a
// registry that folds tagged samples into one sample per distinct tag set, the free-time resolver
// for lab bookings, readers for the raw data sources, and the exposition formats the collected
// metrics are shipped in.
//
// Collectors (in the hpcreport crate) read records through the readers here, build samples with
// canonical tags, and fold them into a MetricRegistry.  Nothing here talks to the network.

pub mod bookings;
pub mod cluster;
pub mod dates;
mod error;
pub mod export;
pub mod gaps;
pub mod joblog;
mod labels;
mod registry;
mod sample;
pub mod store;

// A tag set with content equality, and a sample carrying one.

pub use sample::{TagSet, TaggedSample};

// Metric name -> samples, at most one sample per distinct tag set.

pub use registry::MetricRegistry;

// The error taxonomy shared by readers and collectors.

pub use error::Error;

// Sanitize a free-text name for use as a tag value.

pub use labels::labelize;

// Free intervals within the operating window, per date and lab.

pub use gaps::{resolve_gaps, whole_window_gap, GapInterval, OperatingWindow};
