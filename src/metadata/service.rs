use super::cache::{MetadataCache, MetadataError};
use super::model::{InstanceMetadata, SeriesMetadata, StudyMetadata};
use crate::mhd::{DocumentReference, ManifestSource, StudyQuery};
use crate::types::UI;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Matching keys extracted from a study-level C-FIND identifier.
#[derive(Debug, Clone, Default)]
pub struct StudyKeys {
	pub patient_id: Option<String>,
	pub accession_number: Option<String>,
	pub study_instance_uid: Option<UI>,
	pub modality: Option<String>,
	/// Raw `StudyDate` value, possibly a range expression.
	pub study_date: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SeriesKeys {
	pub study_instance_uid: Option<UI>,
	pub series_instance_uid: Option<UI>,
	pub modality: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceKeys {
	pub study_instance_uid: Option<UI>,
	pub series_instance_uid: Option<UI>,
	pub sop_instance_uid: Option<UI>,
}

/// A DICOM date-range expression: `YYYYMMDD`, `FROM-`, `-TO` or `FROM-TO`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateRange {
	pub from: Option<String>,
	pub to: Option<String>,
}

impl DateRange {
	pub fn parse(value: &str) -> Self {
		let value = value.trim();
		if value.is_empty() {
			return Self::default();
		}
		match value.split_once('-') {
			None => Self {
				from: Some(String::from(value)),
				to: Some(String::from(value)),
			},
			Some((from, to)) => Self {
				from: (!from.is_empty()).then(|| String::from(from)),
				to: (!to.is_empty()).then(|| String::from(to)),
			},
		}
	}
}

/// Resolves C-FIND queries against the MHD upstream and the manifest cache.
pub struct MetadataService {
	source: Arc<dyn ManifestSource>,
	cache: Arc<MetadataCache>,
}

impl MetadataService {
	pub fn new(source: Arc<dyn ManifestSource>, cache: Arc<MetadataCache>) -> Self {
		Self { source, cache }
	}

	pub fn cache(&self) -> &Arc<MetadataCache> {
		&self.cache
	}

	/// Study-level search via ITI-67, with a local modality filter on the
	/// multi-valued `ModalitiesInStudy` projection.
	#[instrument(skip_all)]
	pub async fn find_studies(&self, keys: &StudyKeys) -> Result<Vec<StudyMetadata>, MetadataError> {
		let date_range = keys
			.study_date
			.as_deref()
			.map(DateRange::parse)
			.unwrap_or_default();

		let query = StudyQuery {
			patient_id: keys.patient_id.clone(),
			accession_number: keys.accession_number.clone(),
			study_instance_uid: keys.study_instance_uid.clone(),
			modality: normalize_filter(keys.modality.as_deref()).map(String::from),
			date_from: date_range.from,
			date_to: date_range.to,
		};

		let documents = self.source.search_document_references(&query).await?;
		debug!(count = documents.len(), "Upstream study search finished");

		let modality_filter = normalize_filter(keys.modality.as_deref());
		let studies = documents
			.into_iter()
			.map(project_study)
			.filter(|study| {
				modality_filter.is_none_or(|filter| {
					study
						.modalities_in_study
						.iter()
						.any(|modality| modality.eq_ignore_ascii_case(filter))
				})
			})
			.collect();

		Ok(studies)
	}

	/// Series within one study (manifest-backed), or a cache-only scan when
	/// the query names no study.
	#[instrument(skip_all)]
	pub async fn find_series(&self, keys: &SeriesKeys) -> Result<Vec<SeriesMetadata>, MetadataError> {
		let modality_filter = normalize_filter(keys.modality.as_deref());

		let mut series = match normalize_filter(keys.study_instance_uid.as_deref()) {
			Some(study_instance_uid) => {
				let study = self.cache.get_or_fetch(study_instance_uid).await?;
				study.series.clone()
			}
			None => self.cache.cached_series(None),
		};

		series.retain(|series| {
			normalize_filter(keys.series_instance_uid.as_deref())
				.is_none_or(|filter| series.series_instance_uid == filter)
				&& modality_filter.is_none_or(|filter| {
					series
						.modality
						.as_deref()
						.is_some_and(|modality| modality.eq_ignore_ascii_case(filter))
				})
		});

		Ok(series)
	}

	/// Instances within one study; the study UID is mandatory here.
	#[instrument(skip_all)]
	pub async fn find_instances(
		&self,
		keys: &InstanceKeys,
	) -> Result<Vec<InstanceMetadata>, MetadataError> {
		let study_instance_uid = normalize_filter(keys.study_instance_uid.as_deref())
			.ok_or(MetadataError::MissingStudyUid)?;

		let study = self.cache.get_or_fetch(study_instance_uid).await?;

		let instances = study
			.series
			.iter()
			.filter(|series| {
				normalize_filter(keys.series_instance_uid.as_deref())
					.is_none_or(|filter| series.series_instance_uid == filter)
			})
			.flat_map(|series| series.instances.iter())
			.filter(|instance| {
				normalize_filter(keys.sop_instance_uid.as_deref())
					.is_none_or(|filter| instance.sop_instance_uid == filter)
			})
			.cloned()
			.collect();

		Ok(instances)
	}
}

/// Lightweight study projection for search results: no series tree yet, the
/// counts and modalities come straight from the DocumentReference.
fn project_study(document: DocumentReference) -> StudyMetadata {
	StudyMetadata {
		study_instance_uid: document.study_instance_uid,
		patient_id: document.patient_id,
		patient_name: document.patient_name,
		study_date: document.study_date,
		study_time: document.study_time,
		study_description: document.description,
		accession_number: document.accession_number,
		referring_physician_name: document.referring_physician_name,
		modalities_in_study: document.modalities_in_study,
		..StudyMetadata::default()
	}
}

/// Empty values and the `*` wildcard both mean "match anything".
fn normalize_filter(value: Option<&str>) -> Option<&str> {
	value
		.map(str::trim)
		.filter(|value| !value.is_empty() && *value != "*")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mhd::MhdError;
	use bytes::Bytes;

	struct StubSource {
		documents: Vec<DocumentReference>,
	}

	#[async_trait::async_trait]
	impl ManifestSource for StubSource {
		async fn search_document_references(
			&self,
			_query: &StudyQuery,
		) -> Result<Vec<DocumentReference>, MhdError> {
			Ok(self.documents.clone())
		}

		async fn retrieve_manifest(
			&self,
			_study_instance_uid: &str,
		) -> Result<Option<Bytes>, MhdError> {
			Ok(None)
		}
	}

	fn service(documents: Vec<DocumentReference>) -> MetadataService {
		let source: Arc<dyn ManifestSource> = Arc::new(StubSource { documents });
		let cache = Arc::new(MetadataCache::new(
			Arc::clone(&source),
			std::time::Duration::from_secs(60),
		));
		MetadataService::new(source, cache)
	}

	fn document(study_uid: &str, modalities: &[&str]) -> DocumentReference {
		DocumentReference {
			study_instance_uid: UI::from(study_uid),
			modalities_in_study: modalities.iter().map(|m| String::from(*m)).collect(),
			..DocumentReference::default()
		}
	}

	#[tokio::test]
	async fn study_search_filters_on_modality() {
		let service = service(vec![
			document("1.2.3.4.5.6.7.8.2", &["CT"]),
			document("1.2.3.4.5.6.7.8.20", &["MR"]),
		]);

		let all = service.find_studies(&StudyKeys::default()).await.unwrap();
		assert_eq!(all.len(), 2);

		let ct_only = service
			.find_studies(&StudyKeys {
				modality: Some(String::from("ct")),
				..StudyKeys::default()
			})
			.await
			.unwrap();
		assert_eq!(ct_only.len(), 1);
		assert_eq!(ct_only[0].study_instance_uid, "1.2.3.4.5.6.7.8.2");

		let wildcard = service
			.find_studies(&StudyKeys {
				modality: Some(String::from("*")),
				..StudyKeys::default()
			})
			.await
			.unwrap();
		assert_eq!(wildcard.len(), 2);
	}

	#[tokio::test]
	async fn instance_query_requires_study_uid() {
		let service = service(Vec::new());
		assert!(matches!(
			service.find_instances(&InstanceKeys::default()).await,
			Err(MetadataError::MissingStudyUid)
		));
	}

	#[tokio::test]
	async fn series_query_without_study_scans_cache_only() {
		// The stub returns no manifest, so an upstream fetch would error;
		// a study-less series query must not hit the upstream at all.
		let service = service(Vec::new());
		let series = service.find_series(&SeriesKeys::default()).await.unwrap();
		assert!(series.is_empty());
	}

	#[test]
	fn date_range_forms() {
		assert_eq!(
			DateRange::parse("20240101"),
			DateRange {
				from: Some(String::from("20240101")),
				to: Some(String::from("20240101")),
			}
		);
		assert_eq!(
			DateRange::parse("20240101-"),
			DateRange {
				from: Some(String::from("20240101")),
				to: None,
			}
		);
		assert_eq!(
			DateRange::parse("-20241231"),
			DateRange {
				from: None,
				to: Some(String::from("20241231")),
			}
		);
		assert_eq!(
			DateRange::parse("20240101-20241231"),
			DateRange {
				from: Some(String::from("20240101")),
				to: Some(String::from("20241231")),
			}
		);
		assert_eq!(DateRange::parse(""), DateRange::default());
	}

	#[test]
	fn wildcard_and_empty_match_anything() {
		assert_eq!(normalize_filter(Some("*")), None);
		assert_eq!(normalize_filter(Some("")), None);
		assert_eq!(normalize_filter(Some(" CT ")), Some("CT"));
		assert_eq!(normalize_filter(None), None);
	}
}
