//! # turn_by_turn
//!
//! turn_by_turn reads, writes and converts turn-by-turn beam position data
//! from various particle accelerators and tracking codes. Every supported
//! source is normalized into one shared in-memory representation
//! ([`structures::TbtData`]): a set of observation-point x turn matrices per
//! bunch (or per tracked particle), the common turn count, the bunch
//! identifiers and optional metadata such as the acquisition date.
//!
//! ## Supported formats
//!
//! | Format | Source | Read | Write | Convert |
//! |---|---|---|---|---|
//! | `lhc` | LHC BPM system, binary SDDS (legacy ASCII auto-detected) | yes | yes | |
//! | `sps` | SPS BPM system, SDDS with per-monitor arrays | yes | yes | |
//! | `ascii` | legacy turn-by-turn ASCII tables | yes | yes | |
//! | `doros`, `doros_positions`, `doros_oscillations` | LHC DOROS BPMs, HDF5 | yes | yes | |
//! | `iota` | IOTA, HDF5 (two layout versions) | yes | | |
//! | `esrf` | ESRF, Matlab `.mat` | yes | | |
//! | `ptc` | MAD-X PTC tracking output | yes | | |
//! | `trackone` | MAD-X tracking output | yes | | |
//! | `madng` | MAD-NG tracking output, TFS | yes | yes | yes |
//! | `superkekb` | SuperKEKB measurement dumps | yes | | |
//! | `xtrack` | xtrack `Line` with particle monitors | | | yes |
//!
//! The high-level entry points live in the [`io`] module: [`io::read_tbt`],
//! [`io::write_tbt`] and [`io::convert_to_tbt`], dispatching on
//! [`io::Format`]. Requesting an operation a format does not support is an
//! error listing the formats that do, never a panic. The per-format codec
//! modules can also be used directly when format-specific knobs are needed
//! (IOTA layout version, DOROS data kind, the eight-field trackone view).
//!
//! ## Utilities
//!
//! The [`utils`] module provides cross-format helpers: seedable Gaussian
//! noise injection on single matrices or whole measurements, averaging a
//! multi-bunch measurement into a single-bunch one, and conversion between
//! measurements and plain 4-D sample blocks.
//!
//! ## Logging
//!
//! Progress and recoverable oddities (unparseable dates, plane-split
//! fallbacks) are reported through the `log` facade; attach the logger of
//! your choice in the consuming application.
//!
//! ## HDF5
//!
//! The DOROS and IOTA codecs use the HDF5 C library through the `hdf5`
//! crate. It is typically installed with a package manager (homebrew, apt,
//! etc.) and found automatically; set `HDF5_DIR` when a custom install
//! location is used.

pub mod ascii;
pub mod doros;
pub mod error;
pub mod esrf;
pub mod io;
pub mod iota;
pub mod lhc;
pub mod madng;
pub mod ptc;
pub mod sdds;
pub mod sps;
pub mod structures;
pub mod superkekb;
pub mod tfs;
pub mod trackone;
pub mod utils;
pub mod xtrack;
