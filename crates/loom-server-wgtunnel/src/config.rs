// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::retry::Backoff;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
	pub heartbeat_period: Duration,
	pub missed_heartbeats: u32,
	pub unhealthy_after_failures: u32,
	pub cleanup_period: Duration,
	pub retention: Duration,
	pub querier_workers: usize,
	pub binder_workers: usize,
	pub tunneler_workers: usize,
	pub handshaker_workers: usize,
	pub max_backoff: Duration,
	pub request_buffer: usize,
	pub response_buffer: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("invalid value for {key}: {value}")]
	Invalid { key: &'static str, value: String },
}

impl Default for CoordinatorConfig {
	fn default() -> Self {
		Self {
			heartbeat_period: Duration::from_secs(2),
			missed_heartbeats: 3,
			unhealthy_after_failures: 3,
			cleanup_period: Duration::from_secs(60 * 60),
			retention: Duration::from_secs(24 * 60 * 60),
			querier_workers: 10,
			binder_workers: 10,
			tunneler_workers: 10,
			handshaker_workers: 5,
			max_backoff: Duration::from_secs(10),
			request_buffer: 512,
			response_buffer: 512,
		}
	}
}

/// Timers are armed as `now + period`, which must not overflow.
fn schedulable(key: &'static str, period: Duration) -> Result<(), ConfigError> {
	match tokio::time::Instant::now().checked_add(period) {
		Some(_) => Ok(()),
		None => Err(ConfigError::Invalid {
			key,
			value: format!("{period:?}"),
		}),
	}
}

fn lookup_parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
	T: FromStr,
	F: Fn(&str) -> Option<String>,
{
	match lookup(key) {
		Some(value) => value
			.trim()
			.parse()
			.map_err(|_| ConfigError::Invalid { key, value }),
		None => Ok(default),
	}
}

fn lookup_millis<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
	F: Fn(&str) -> Option<String>,
{
	lookup_parse(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn lookup_secs<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
	F: Fn(&str) -> Option<String>,
{
	lookup_parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}

impl CoordinatorConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let defaults = Self::default();

		let config = Self {
			heartbeat_period: lookup_millis(
				&lookup,
				"LOOM_WG_COORD_HEARTBEAT_PERIOD_MS",
				defaults.heartbeat_period,
			)?,
			missed_heartbeats: lookup_parse(
				&lookup,
				"LOOM_WG_COORD_MISSED_HEARTBEATS",
				defaults.missed_heartbeats,
			)?,
			unhealthy_after_failures: lookup_parse(
				&lookup,
				"LOOM_WG_COORD_UNHEALTHY_AFTER_FAILURES",
				defaults.unhealthy_after_failures,
			)?,
			cleanup_period: lookup_secs(
				&lookup,
				"LOOM_WG_COORD_CLEANUP_PERIOD_SECS",
				defaults.cleanup_period,
			)?,
			retention: lookup_secs(&lookup, "LOOM_WG_COORD_RETENTION_SECS", defaults.retention)?,
			querier_workers: lookup_parse(
				&lookup,
				"LOOM_WG_COORD_QUERIER_WORKERS",
				defaults.querier_workers,
			)?,
			binder_workers: lookup_parse(
				&lookup,
				"LOOM_WG_COORD_BINDER_WORKERS",
				defaults.binder_workers,
			)?,
			tunneler_workers: lookup_parse(
				&lookup,
				"LOOM_WG_COORD_TUNNELER_WORKERS",
				defaults.tunneler_workers,
			)?,
			handshaker_workers: lookup_parse(
				&lookup,
				"LOOM_WG_COORD_HANDSHAKER_WORKERS",
				defaults.handshaker_workers,
			)?,
			max_backoff: lookup_millis(&lookup, "LOOM_WG_COORD_MAX_BACKOFF_MS", defaults.max_backoff)?,
			request_buffer: lookup_parse(
				&lookup,
				"LOOM_WG_COORD_REQUEST_BUFFER",
				defaults.request_buffer,
			)?,
			response_buffer: lookup_parse(
				&lookup,
				"LOOM_WG_COORD_RESPONSE_BUFFER",
				defaults.response_buffer,
			)?,
		};

		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		fn non_zero(key: &'static str, value: u64) -> Result<(), ConfigError> {
			if value == 0 {
				return Err(ConfigError::Invalid {
					key,
					value: value.to_string(),
				});
			}
			Ok(())
		}

		non_zero(
			"heartbeat_period",
			self.heartbeat_period.as_millis() as u64,
		)?;
		non_zero("missed_heartbeats", self.missed_heartbeats as u64)?;
		non_zero(
			"unhealthy_after_failures",
			self.unhealthy_after_failures as u64,
		)?;
		non_zero("cleanup_period", self.cleanup_period.as_millis() as u64)?;
		non_zero("querier_workers", self.querier_workers as u64)?;
		non_zero("binder_workers", self.binder_workers as u64)?;
		non_zero("tunneler_workers", self.tunneler_workers as u64)?;
		non_zero("handshaker_workers", self.handshaker_workers as u64)?;
		non_zero("max_backoff", self.max_backoff.as_millis() as u64)?;
		non_zero("request_buffer", self.request_buffer as u64)?;
		non_zero("response_buffer", self.response_buffer as u64)?;

		let timeout = self
			.heartbeat_period
			.checked_mul(self.missed_heartbeats)
			.ok_or_else(|| ConfigError::Invalid {
				key: "heartbeat_period",
				value: format!("{:?}", self.heartbeat_period),
			})?;
		schedulable("heartbeat_period", timeout)?;
		schedulable("cleanup_period", self.cleanup_period)?;
		schedulable("max_backoff", self.max_backoff)?;

		let retention = chrono::Duration::from_std(self.retention).ok();
		if retention.and_then(|r| chrono::Utc::now().checked_sub_signed(r)).is_none() {
			return Err(ConfigError::Invalid {
				key: "retention",
				value: format!("{:?}", self.retention),
			});
		}
		Ok(())
	}

	/// How long a remote replica may go without a heartbeat before its
	/// mappings are treated as lost.
	pub fn heartbeat_timeout(&self) -> Duration {
		self.heartbeat_period.saturating_mul(self.missed_heartbeats)
	}

	pub fn backoff(&self) -> Backoff {
		Backoff::with_max_delay(self.max_backoff)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		move |key| map.get(key).cloned()
	}

	#[test]
	fn defaults_match_documented_values() {
		let config = CoordinatorConfig::default();
		assert_eq!(config.heartbeat_period, Duration::from_secs(2));
		assert_eq!(config.heartbeat_timeout(), Duration::from_secs(6));
		assert_eq!(config.retention, Duration::from_secs(86_400));
		assert_eq!(config.querier_workers, 10);
		assert_eq!(config.handshaker_workers, 5);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn empty_environment_yields_defaults() {
		let config = CoordinatorConfig::from_lookup(lookup_from(&[])).unwrap();
		assert_eq!(config.max_backoff, Duration::from_secs(10));
		assert_eq!(config.response_buffer, 512);
	}

	#[test]
	fn overrides_are_applied() {
		let config = CoordinatorConfig::from_lookup(lookup_from(&[
			("LOOM_WG_COORD_HEARTBEAT_PERIOD_MS", "250"),
			("LOOM_WG_COORD_MISSED_HEARTBEATS", "4"),
			("LOOM_WG_COORD_BINDER_WORKERS", " 2 "),
			("LOOM_WG_COORD_RETENTION_SECS", "60"),
		]))
		.unwrap();
		assert_eq!(config.heartbeat_period, Duration::from_millis(250));
		assert_eq!(config.heartbeat_timeout(), Duration::from_secs(1));
		assert_eq!(config.binder_workers, 2);
		assert_eq!(config.retention, Duration::from_secs(60));
	}

	#[test]
	fn unparseable_value_is_rejected() {
		let err = CoordinatorConfig::from_lookup(lookup_from(&[(
			"LOOM_WG_COORD_QUERIER_WORKERS",
			"many",
		)]))
		.unwrap_err();
		match err {
			ConfigError::Invalid { key, value } => {
				assert_eq!(key, "LOOM_WG_COORD_QUERIER_WORKERS");
				assert_eq!(value, "many");
			}
		}
	}

	#[test]
	fn zero_workers_rejected() {
		let err = CoordinatorConfig::from_lookup(lookup_from(&[(
			"LOOM_WG_COORD_TUNNELER_WORKERS",
			"0",
		)]))
		.unwrap_err();
		assert!(matches!(
			err,
			ConfigError::Invalid {
				key: "tunneler_workers",
				..
			}
		));
	}

	#[test]
	fn zero_heartbeat_period_rejected() {
		let config = CoordinatorConfig {
			heartbeat_period: Duration::ZERO,
			..Default::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn overflowing_heartbeat_timeout_rejected() {
		let err = CoordinatorConfig::from_lookup(lookup_from(&[
			("LOOM_WG_COORD_HEARTBEAT_PERIOD_MS", "18446744073709551615"),
			("LOOM_WG_COORD_MISSED_HEARTBEATS", "4294967295"),
		]))
		.unwrap_err();
		assert!(matches!(
			err,
			ConfigError::Invalid {
				key: "heartbeat_period",
				..
			}
		));
	}

	#[test]
	fn unrepresentable_retention_rejected() {
		let err = CoordinatorConfig::from_lookup(lookup_from(&[(
			"LOOM_WG_COORD_RETENTION_SECS",
			"18446744073709551615",
		)]))
		.unwrap_err();
		assert!(matches!(err, ConfigError::Invalid { key: "retention", .. }));
	}
}
