//! Format registry and high-level entry points.
//!
//! Every supported format has a static capability record declaring which of
//! the three operations (read, write, in-memory convert) its codec
//! implements, plus format quirks the dispatcher applies: the DOROS data
//! kind encoded in the format name and the `.sdds` suffix convention of the
//! CERN acquisition files. [`read_tbt`], [`write_tbt`] and
//! [`convert_to_tbt`] validate the requested operation against that record
//! before touching any codec.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::doros::{self, DataKind};
use super::error::TbtError;
use super::structures::TbtData;
use super::tfs::TfsTable;
use super::xtrack::Line;
use super::{ascii, esrf, iota, lhc, madng, ptc, sps, superkekb, trackone, utils, xtrack};

/// The supported turn-by-turn formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Lhc,
    Sps,
    Ascii,
    Doros,
    DorosPositions,
    DorosOscillations,
    Iota,
    Esrf,
    Ptc,
    Trackone,
    MadNg,
    SuperKekb,
    Xtrack,
}

/// What a format's codec implements, resolved once per format.
struct Capabilities {
    name: &'static str,
    can_read: bool,
    can_write: bool,
    can_convert: bool,
    /// DOROS data kind encoded in the format name.
    doros_kind: Option<DataKind>,
    /// Files of this format conventionally carry an `.sdds` suffix.
    sdds_suffix: bool,
}

const fn caps(name: &'static str, can_read: bool, can_write: bool) -> Capabilities {
    Capabilities {
        name,
        can_read,
        can_write,
        can_convert: false,
        doros_kind: None,
        sdds_suffix: false,
    }
}

/// One record per [`Format`], in declaration order.
const CAPABILITIES: [Capabilities; 13] = [
    Capabilities {
        sdds_suffix: true,
        ..caps("lhc", true, true)
    },
    Capabilities {
        sdds_suffix: true,
        ..caps("sps", true, true)
    },
    Capabilities {
        sdds_suffix: true,
        ..caps("ascii", true, true)
    },
    Capabilities {
        doros_kind: Some(DataKind::Positions),
        ..caps("doros", true, true)
    },
    Capabilities {
        doros_kind: Some(DataKind::Positions),
        ..caps("doros_positions", true, true)
    },
    Capabilities {
        doros_kind: Some(DataKind::Oscillations),
        ..caps("doros_oscillations", true, true)
    },
    caps("iota", true, false),
    caps("esrf", true, false),
    caps("ptc", true, false),
    caps("trackone", true, false),
    Capabilities {
        can_convert: true,
        ..caps("madng", true, true)
    },
    caps("superkekb", true, false),
    Capabilities {
        can_convert: true,
        ..caps("xtrack", false, false)
    },
];

impl Format {
    pub const ALL: [Format; 13] = [
        Format::Lhc,
        Format::Sps,
        Format::Ascii,
        Format::Doros,
        Format::DorosPositions,
        Format::DorosOscillations,
        Format::Iota,
        Format::Esrf,
        Format::Ptc,
        Format::Trackone,
        Format::MadNg,
        Format::SuperKekb,
        Format::Xtrack,
    ];

    fn capabilities(self) -> &'static Capabilities {
        &CAPABILITIES[self as usize]
    }

    /// The registry name of this format.
    pub fn name(self) -> &'static str {
        self.capabilities().name
    }

    fn supporting(operation: impl Fn(&Capabilities) -> bool) -> Vec<&'static str> {
        Format::ALL
            .iter()
            .map(|format| format.capabilities())
            .filter(|caps| operation(caps))
            .map(|caps| caps.name)
            .collect()
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = TbtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requested = s.to_lowercase();
        Format::ALL
            .iter()
            .find(|format| format.name() == requested)
            .copied()
            .ok_or_else(|| TbtError::UnsupportedFormat {
                requested: s.to_string(),
                valid: Format::supporting(|_| true),
            })
    }
}

/// An in-memory source for [`convert_to_tbt`].
#[derive(Debug)]
pub enum ConvertSource<'a> {
    MadNg(&'a TfsTable),
    XtrackLine(&'a Line),
}

/// Read a measurement file with the given format's codec.
pub fn read_tbt(path: &Path, format: Format) -> Result<TbtData, TbtError> {
    log::info!("loading turn-by-turn data from '{}'", path.display());
    let caps = format.capabilities();
    if !caps.can_read {
        return Err(TbtError::UnsupportedDirection {
            format: caps.name,
            operation: "reading",
            valid: Format::supporting(|caps| caps.can_read),
        });
    }
    match format {
        Format::Lhc => lhc::read_tbt(path),
        Format::Sps => sps::read_tbt(path),
        Format::Ascii => ascii::read_tbt(path),
        Format::Doros | Format::DorosPositions | Format::DorosOscillations => {
            // the kind is part of the capability record
            doros::read_tbt(path, caps.doros_kind.unwrap_or(DataKind::Positions))
        }
        Format::Iota => iota::read_tbt(path, iota::Version::Two),
        Format::Esrf => esrf::read_tbt(path),
        Format::Ptc => ptc::read_tbt(path),
        Format::Trackone => trackone::read_tbt(path),
        Format::MadNg => madng::read_tbt(path),
        Format::SuperKekb => superkekb::read_tbt(path),
        Format::Xtrack => unreachable!("rejected by the capability check"),
    }
}

/// Write a measurement with the given format's codec.
///
/// `noise` perturbs a copy of the measurement with seedable Gaussian noise
/// before encoding; the input is never modified. Formats with an `.sdds`
/// file convention get the suffix appended when missing.
pub fn write_tbt(
    path: &Path,
    data: &TbtData,
    format: Format,
    noise: Option<f64>,
    seed: Option<u64>,
) -> Result<(), TbtError> {
    let caps = format.capabilities();
    if !caps.can_write {
        return Err(TbtError::UnsupportedDirection {
            format: caps.name,
            operation: "writing",
            valid: Format::supporting(|caps| caps.can_write),
        });
    }
    let path = if caps.sdds_suffix {
        with_sdds_suffix(path)
    } else {
        path.to_path_buf()
    };
    log::info!("writing turn-by-turn data to '{}'", path.display());

    let perturbed;
    let data = if noise.is_some() {
        perturbed = utils::add_noise_to_tbt(data, noise, None, seed)?;
        &perturbed
    } else {
        data
    };

    match format {
        Format::Lhc => lhc::write_tbt(&path, data),
        Format::Sps => sps::write_tbt(&path, data),
        Format::Ascii => ascii::write_tbt(&path, data),
        Format::Doros | Format::DorosPositions | Format::DorosOscillations => {
            doros::write_tbt(&path, data, caps.doros_kind.unwrap_or(DataKind::Positions))
        }
        Format::MadNg => madng::write_tbt(&path, data),
        _ => unreachable!("rejected by the capability check"),
    }
}

/// Convert an in-memory tracking result with the given format's converter.
pub fn convert_to_tbt(source: ConvertSource<'_>, format: Format) -> Result<TbtData, TbtError> {
    let caps = format.capabilities();
    if !caps.can_convert {
        return Err(TbtError::UnsupportedDirection {
            format: caps.name,
            operation: "in-memory conversion",
            valid: Format::supporting(|caps| caps.can_convert),
        });
    }
    match (format, source) {
        (Format::MadNg, ConvertSource::MadNg(table)) => madng::from_table(table),
        (Format::Xtrack, ConvertSource::XtrackLine(line)) => xtrack::convert_to_tbt(line),
        (_, source) => Err(TbtError::MalformedSource(format!(
            "source {source:?} does not match format '{}'",
            caps.name
        ))),
    }
}

fn with_sdds_suffix(path: &Path) -> PathBuf {
    match path.extension() {
        Some(extension) if extension.eq_ignore_ascii_case("sdds") => path.to_path_buf(),
        _ => {
            let mut name = path.file_name().unwrap_or_default().to_os_string();
            name.push(".sdds");
            path.with_file_name(name)
        }
    }
}
