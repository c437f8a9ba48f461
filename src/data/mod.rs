pub mod batch_planner;
pub mod concurrent_backfill;
pub mod csv_sink;
pub mod pipeline;

pub use batch_planner::BatchPlanner;
pub use concurrent_backfill::{save_report, BackfillRequest, ConcurrentBackfill, RunStats};
pub use csv_sink::{output_filename, read_bars, CsvSink};
pub use pipeline::{BarSource, FetchPipeline};
