//! Production boot validation.

use thiserror::Error;

use crate::types::Config;

/// Minimum length for `SECRET_KEY_BASE` in production.
const SECRET_KEY_BASE_MIN: usize = 64;
/// Minimum length for the HMAC secret in production.
const HMAC_SECRET_MIN: usize = 32;

/// Reasons the daemon refuses to boot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required secret is absent.
    #[error("missing required secret: {name}")]
    MissingSecret {
        /// Environment variable name.
        name: &'static str,
    },

    /// A secret is present but too short.
    #[error("secret {name} too short: {len} < {min} chars")]
    WeakSecret {
        /// Environment variable name.
        name: &'static str,
        /// Observed length.
        len: usize,
        /// Required minimum.
        min: usize,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Validate the configuration for its environment.
///
/// Development accepts anything structurally sound; production refuses to
/// proceed when required secrets are missing or too short.
///
/// # Errors
///
/// Returns the first [`ConfigError`] found.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.security.replay_window_secs > 24 * 60 * 60 {
        return Err(ConfigError::Invalid(
            "replay window exceeds 24 hours".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&config.security.bloom_fp_rate) || config.security.bloom_fp_rate <= 0.0
    {
        return Err(ConfigError::Invalid(
            "bloom false-positive rate must be in (0, 1)".to_string(),
        ));
    }

    if !config.environment.is_production() {
        return Ok(());
    }

    let Some(hmac) = config.security.hmac_secret.as_ref() else {
        return Err(ConfigError::MissingSecret {
            name: "CYBERNETIC_HMAC_SECRET",
        });
    };
    if hmac.len() < HMAC_SECRET_MIN {
        return Err(ConfigError::WeakSecret {
            name: "CYBERNETIC_HMAC_SECRET",
            len: hmac.len(),
            min: HMAC_SECRET_MIN,
        });
    }

    let Some(base) = config.security.secret_key_base.as_ref() else {
        return Err(ConfigError::MissingSecret {
            name: "SECRET_KEY_BASE",
        });
    };
    if base.len() < SECRET_KEY_BASE_MIN {
        return Err(ConfigError::WeakSecret {
            name: "SECRET_KEY_BASE",
            len: base.len(),
            min: SECRET_KEY_BASE_MIN,
        });
    }

    Ok(())
}
