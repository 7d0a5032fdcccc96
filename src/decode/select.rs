//! Decoder selection: an ordered list of candidates, first success wins.

use serde::{Deserialize, Serialize};

use crate::decode::error::OpenError;

/// Which decoder family to try first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePreference {
    #[default]
    Software,
    /// NVIDIA (cuvid) decoders
    HardwareA,
    /// Intel Quick Sync decoders
    HardwareB,
}

impl DecodePreference {
    /// Suffix of the hardware decoder names, e.g. `h264_cuvid`
    pub fn hardware_suffix(&self) -> Option<&'static str> {
        match self {
            DecodePreference::Software => None,
            DecodePreference::HardwareA => Some("cuvid"),
            DecodePreference::HardwareB => Some("qsv"),
        }
    }

    /// Candidates to try for `codec`, in order
    pub fn candidates(&self, codec: &str) -> Vec<DecoderCandidate> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(suffix) = self.hardware_suffix() {
            candidates.push(DecoderCandidate::Named(format!("{}_{}", codec, suffix)));
        }
        candidates.push(DecoderCandidate::Generic);
        candidates
    }
}

/// One way of obtaining a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderCandidate {
    /// Look the decoder up by its registered name
    Named(String),
    /// The library's default decoder for the codec id
    Generic,
}

impl DecoderCandidate {
    pub fn label<'a>(&'a self, codec: &'a str) -> &'a str {
        match self {
            DecoderCandidate::Named(name) => name,
            DecoderCandidate::Generic => codec,
        }
    }
}

/// Decoder that opened, with the name it was found under
#[derive(Debug)]
pub struct Selected<D> {
    pub decoder: D,
    pub name: String,
}

/// Try each candidate in order and keep the first that opens.
pub fn select_decoder<D, F>(
    codec: &str,
    candidates: &[DecoderCandidate],
    mut try_open: F,
) -> Result<Selected<D>, OpenError>
where
    F: FnMut(&DecoderCandidate) -> Result<D, String>,
{
    let mut tried = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let label = candidate.label(codec);
        match try_open(candidate) {
            Ok(decoder) => {
                if !tried.is_empty() {
                    tracing::debug!("Decoder {} selected after fallback from {:?}", label, tried);
                }
                return Ok(Selected {
                    decoder,
                    name: label.to_string(),
                });
            }
            Err(reason) => {
                tracing::debug!("Decoder candidate {} unavailable: {}", label, reason);
                tried.push(label.to_string());
            }
        }
    }

    Err(OpenError::DecoderUnavailable {
        codec: codec.to_string(),
        tried: tried.join(", "),
    })
}
