//! Capture and replay options.
//!
//! All option structs deserialize from JSON with every field optional, so a
//! configuration file only needs to mention what it changes:
//!
//! ```json
//! { "capture_frames": [120], "min_drawcalls": 2, "hot_resources": { "min_draws": 16 } }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::{fs, io};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureOptions {
    /// Frame numbers at which to start a capture without an explicit
    /// request.
    pub capture_frames: Vec<u64>,
    /// Where finalized logs are written, as `frame<N>.glcap`. Logs are only
    /// kept in memory when this is unset.
    pub output_dir: Option<PathBuf>,
    /// A captured frame with fewer drawcalls than this is discarded.
    pub min_drawcalls: u64,
    /// The largest log a single capture may produce, in bytes.
    pub size_limit: u64,
    pub hot_resources: HotResourceOptions,
}

impl Default for CaptureOptions {
    fn default() -> CaptureOptions {
        CaptureOptions {
            capture_frames: Vec::new(),
            output_dir: None,
            min_drawcalls: 1,
            size_limit: 4 * 1024 * 1024 * 1024,
            hot_resources: HotResourceOptions::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HotResourceOptions {
    pub enabled: bool,
    /// The fraction of a frame's draws a resource must be mutated before to
    /// be flagged.
    pub mutation_ratio: f64,
    /// Frames with fewer draws than this never flag anything.
    pub min_draws: u64,
}

impl Default for HotResourceOptions {
    fn default() -> HotResourceOptions {
        HotResourceOptions {
            enabled: true,
            mutation_ratio: 0.75,
            min_draws: 8,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayOptions {
    /// Refuse to replay chunks that were only partially recorded, rather
    /// than warning and carrying on.
    pub verify_partial_chunks: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error reading configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

/// Load options from a JSON file.
pub fn load<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    from_json(&text)
}

#[test]
fn test_partial_config() {
    let options: CaptureOptions =
        from_json(r#"{ "capture_frames": [120], "hot_resources": { "min_draws": 16 } }"#).unwrap();
    assert_eq!(options.capture_frames, [120]);
    assert_eq!(options.min_drawcalls, 1);
    assert_eq!(options.hot_resources.min_draws, 16);
    assert_eq!(options.hot_resources.mutation_ratio, 0.75);

    let replay: ReplayOptions = from_json("{}").unwrap();
    assert!(!replay.verify_partial_chunks);
}

#[test]
fn test_rejects_unknown_fields() {
    assert!(matches!(
        from_json::<CaptureOptions>(r#"{ "min_drawcals": 2 }"#),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        load::<ReplayOptions, _>("/nonexistent/replay.json"),
        Err(ConfigError::Io { .. })
    ));
}
