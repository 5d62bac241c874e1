//! Text formats around the network inversion

pub mod network_file;
pub mod template;

pub use network_file::{read_baseline_list, read_date12_list, write_date12_list};
pub use template::{read_template, Template};
