use crate::config::{AetEntryConfig, AetFallbackConfig};
use std::collections::HashMap;

/// A resolved move destination on the DIMSE network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AetTarget {
	pub host: String,
	pub port: u16,
	pub description: Option<String>,
}

/// Directory of known application entities, keyed by uppercase AE title.
/// Unknown titles resolve to the configured fallback, if any.
#[derive(Debug, Default)]
pub struct AeDirectory {
	entries: HashMap<String, AetTarget>,
	fallback: Option<AetTarget>,
}

impl AeDirectory {
	pub fn new(entries: &[AetEntryConfig], fallback: Option<&AetFallbackConfig>) -> Self {
		let entries = entries
			.iter()
			.map(|entry| {
				(
					entry.aet.to_uppercase(),
					AetTarget {
						host: entry.host.clone(),
						port: entry.port,
						description: entry.description.clone(),
					},
				)
			})
			.collect();

		Self {
			entries,
			fallback: fallback.map(|fallback| AetTarget {
				host: fallback.host.clone(),
				port: fallback.port,
				description: None,
			}),
		}
	}

	pub fn resolve(&self, aet: &str) -> Option<AetTarget> {
		self.entries
			.get(&aet.trim().to_uppercase())
			.cloned()
			.or_else(|| self.fallback.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn directory(fallback: Option<AetFallbackConfig>) -> AeDirectory {
		AeDirectory::new(
			&[AetEntryConfig {
				aet: String::from("Dest"),
				host: String::from("pacs.example"),
				port: 104,
				description: Some(String::from("archive")),
			}],
			fallback.as_ref(),
		)
	}

	#[test]
	fn lookup_is_case_insensitive() {
		let directory = directory(None);
		let target = directory.resolve("dest").unwrap();
		assert_eq!(target.host, "pacs.example");
		assert_eq!(target.port, 104);
		assert_eq!(directory.resolve(" DEST ").unwrap(), target);
	}

	#[test]
	fn unknown_title_uses_fallback_when_configured() {
		assert!(directory(None).resolve("NOBODY").is_none());

		let with_fallback = directory(Some(AetFallbackConfig {
			host: String::from("fallback.example"),
			port: 11113,
		}));
		let target = with_fallback.resolve("NOBODY").unwrap();
		assert_eq!(target.host, "fallback.example");
		assert_eq!(target.port, 11113);
	}
}
