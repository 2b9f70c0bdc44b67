use std::{fmt::Display, str::FromStr};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Numeric precision of the KV cache.
///
/// Opaque to the scheduler; it only changes how many bytes one cache block occupies.
///
/// ## `Auto` rules
/// - If CUDA device or CPU, use BF16
/// - Fallback to F32
pub enum ModelDType {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::BF16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

impl FromStr for ModelDType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "bf16" => Ok(Self::BF16),
            "f16" => Ok(Self::F16),
            "f32" => Ok(Self::F32),
            other => Err(format!("Cache DType `{other}` is not supported.")),
        }
    }
}

/// Type which can be converted to a DType
pub trait TryIntoDType {
    fn try_into_dtype(&self, device: &Device) -> Result<DType>;
}

impl TryIntoDType for DType {
    fn try_into_dtype(&self, _: &Device) -> Result<DType> {
        if !matches!(self, DType::BF16 | DType::F32 | DType::F64 | DType::F16) {
            return Err(Error::InvalidConfig(format!(
                "DType must be one of BF16, F16, F32, F64, got {self:?}"
            )));
        }
        Ok(*self)
    }
}

impl TryIntoDType for ModelDType {
    fn try_into_dtype(&self, device: &Device) -> Result<DType> {
        let dtype = match self {
            Self::Auto => {
                if device.is_cuda() || device.is_cpu() {
                    DType::BF16
                } else {
                    DType::F32
                }
            }
            Self::BF16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        info!("KV cache DType selected is {dtype:?}.");
        Ok(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        for s in ["auto", "bf16", "f16", "f32"] {
            let dtype: ModelDType = s.parse().unwrap();
            assert_eq!(dtype.to_string(), s);
        }
        assert!("int4".parse::<ModelDType>().is_err());
    }

    #[test]
    fn auto_on_cpu_is_bf16() {
        let dtype = ModelDType::Auto.try_into_dtype(&Device::Cpu).unwrap();
        assert_eq!(dtype, DType::BF16);
        assert_eq!(
            ModelDType::F16.try_into_dtype(&Device::Cpu).unwrap(),
            DType::F16
        );
    }

    #[test]
    fn rejects_integer_dtypes() {
        assert!(DType::U8.try_into_dtype(&Device::Cpu).is_err());
    }
}
