use super::manifest::{self, ManifestError};
use super::model::{SeriesMetadata, StudyMetadata};
use crate::mhd::{ManifestSource, MhdError};
use crate::types::UI;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum MetadataError {
	#[error(transparent)]
	Mhd(#[from] MhdError),
	#[error(transparent)]
	Manifest(#[from] ManifestError),
	#[error("No manifest available for study {0}")]
	NotFound(UI),
	#[error("Query requires a Study Instance UID")]
	MissingStudyUid,
}

struct CachedStudy {
	study: Arc<StudyMetadata>,
	fetched_at: Instant,
}

/// TTL cache of parsed manifests, keyed by Study Instance UID.
///
/// Fetches for the same study are coalesced: while one caller is talking to
/// the upstream, late arrivals wait on a per-UID lock and then read the fresh
/// cache entry instead of fetching again.
pub struct MetadataCache {
	source: Arc<dyn ManifestSource>,
	ttl: Duration,
	entries: Mutex<HashMap<UI, CachedStudy>>,
	fetch_locks: Mutex<HashMap<UI, Arc<tokio::sync::Mutex<()>>>>,
}

impl MetadataCache {
	pub fn new(source: Arc<dyn ManifestSource>, ttl: Duration) -> Self {
		Self {
			source,
			ttl,
			entries: Mutex::new(HashMap::new()),
			fetch_locks: Mutex::new(HashMap::new()),
		}
	}

	/// Returns the cached study if it is still fresh, fetching and parsing the
	/// manifest otherwise. A failed fetch leaves the cache unchanged.
	#[instrument(skip(self))]
	pub async fn get_or_fetch(
		&self,
		study_instance_uid: &str,
	) -> Result<Arc<StudyMetadata>, MetadataError> {
		if let Some(hit) = self.lookup(study_instance_uid) {
			return Ok(hit);
		}

		let fetch_lock = self.fetch_lock(study_instance_uid);
		let _guard = fetch_lock.lock().await;

		// A concurrent caller may have completed the fetch while we waited.
		if let Some(hit) = self.lookup(study_instance_uid) {
			return Ok(hit);
		}

		let result = self.fetch(study_instance_uid).await;
		self.release_fetch_lock(study_instance_uid);
		result
	}

	async fn fetch(&self, study_instance_uid: &str) -> Result<Arc<StudyMetadata>, MetadataError> {
		debug!(study_instance_uid, "Fetching manifest from upstream");
		let bytes = self
			.source
			.retrieve_manifest(study_instance_uid)
			.await?
			.ok_or_else(|| MetadataError::NotFound(UI::from(study_instance_uid)))?;

		let study = match manifest::parse(&bytes) {
			Ok(study) => Arc::new(study),
			Err(err) => {
				warn!(study_instance_uid, "Manifest rejected: {err}");
				return Err(err.into());
			}
		};

		let mut entries = self.entries.lock().expect("metadata cache lock poisoned");
		entries.insert(
			UI::from(study_instance_uid),
			CachedStudy {
				study: Arc::clone(&study),
				fetched_at: Instant::now(),
			},
		);
		Ok(study)
	}

	fn lookup(&self, study_instance_uid: &str) -> Option<Arc<StudyMetadata>> {
		let entries = self.entries.lock().expect("metadata cache lock poisoned");
		entries
			.get(study_instance_uid)
			.filter(|cached| cached.fetched_at.elapsed() <= self.ttl)
			.map(|cached| Arc::clone(&cached.study))
	}

	fn fetch_lock(&self, study_instance_uid: &str) -> Arc<tokio::sync::Mutex<()>> {
		let mut locks = self.fetch_locks.lock().expect("fetch lock map poisoned");
		Arc::clone(
			locks
				.entry(UI::from(study_instance_uid))
				.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
		)
	}

	fn release_fetch_lock(&self, study_instance_uid: &str) {
		let mut locks = self.fetch_locks.lock().expect("fetch lock map poisoned");
		locks.remove(study_instance_uid);
	}

	/// All fresh cached series matching the given series UID filter.
	/// Used by series-level queries that name no study.
	pub fn cached_series(&self, series_instance_uid: Option<&str>) -> Vec<SeriesMetadata> {
		let entries = self.entries.lock().expect("metadata cache lock poisoned");
		entries
			.values()
			.filter(|cached| cached.fetched_at.elapsed() <= self.ttl)
			.flat_map(|cached| cached.study.series.iter())
			.filter(|series| {
				series_instance_uid
					.is_none_or(|filter| series.series_instance_uid == filter)
			})
			.cloned()
			.collect()
	}

	pub fn clear(&self) {
		let mut entries = self.entries.lock().expect("metadata cache lock poisoned");
		entries.clear();
	}

	pub fn len(&self) -> usize {
		let entries = self.entries.lock().expect("metadata cache lock poisoned");
		entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mhd::{DocumentReference, StudyQuery};
	use bytes::Bytes;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::dictionary_std::{tags, uids};
	use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct CountingSource {
		fetches: AtomicUsize,
		manifest: Option<Bytes>,
		delay: Duration,
	}

	impl CountingSource {
		fn new(manifest: Option<Bytes>) -> Self {
			Self {
				fetches: AtomicUsize::new(0),
				manifest,
				delay: Duration::ZERO,
			}
		}

		fn fetch_count(&self) -> usize {
			self.fetches.load(Ordering::SeqCst)
		}
	}

	#[async_trait::async_trait]
	impl ManifestSource for CountingSource {
		async fn search_document_references(
			&self,
			_query: &StudyQuery,
		) -> Result<Vec<DocumentReference>, MhdError> {
			Ok(Vec::new())
		}

		async fn retrieve_manifest(
			&self,
			_study_instance_uid: &str,
		) -> Result<Option<Bytes>, MhdError> {
			self.fetches.fetch_add(1, Ordering::SeqCst);
			if !self.delay.is_zero() {
				tokio::time::sleep(self.delay).await;
			}
			Ok(self.manifest.clone())
		}
	}

	fn manifest_bytes(study_instance_uid: &str) -> Bytes {
		let dataset = InMemDicomObject::from_element_iter([DataElement::new(
			tags::STUDY_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, study_instance_uid),
		)]);
		let file = dataset.with_exact_meta(
			FileMetaTableBuilder::new()
				.media_storage_sop_class_uid(uids::KEY_OBJECT_SELECTION_DOCUMENT_STORAGE)
				.media_storage_sop_instance_uid("1.2.3.4.99")
				.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
				.build()
				.unwrap(),
		);
		let mut buffer = Vec::new();
		file.write_all(&mut buffer).unwrap();
		Bytes::from(buffer)
	}

	#[tokio::test]
	async fn concurrent_fetches_coalesce() {
		let mut source = CountingSource::new(Some(manifest_bytes("1.2.3")));
		source.delay = Duration::from_millis(50);
		let source = Arc::new(source);
		let cache = Arc::new(MetadataCache::new(
			Arc::clone(&source) as Arc<dyn ManifestSource>,
			Duration::from_secs(60),
		));

		let mut tasks = Vec::new();
		for _ in 0..8 {
			let cache = Arc::clone(&cache);
			tasks.push(tokio::spawn(async move {
				cache.get_or_fetch("1.2.3").await.unwrap()
			}));
		}
		for task in tasks {
			let study = task.await.unwrap();
			assert_eq!(study.study_instance_uid, "1.2.3");
		}

		assert_eq!(source.fetch_count(), 1);
	}

	#[tokio::test]
	async fn expired_entries_are_refetched() {
		let source = Arc::new(CountingSource::new(Some(manifest_bytes("1.2.3"))));
		let cache = MetadataCache::new(
			Arc::clone(&source) as Arc<dyn ManifestSource>,
			Duration::from_millis(20),
		);

		cache.get_or_fetch("1.2.3").await.unwrap();
		cache.get_or_fetch("1.2.3").await.unwrap();
		assert_eq!(source.fetch_count(), 1);

		tokio::time::sleep(Duration::from_millis(40)).await;
		cache.get_or_fetch("1.2.3").await.unwrap();
		assert_eq!(source.fetch_count(), 2);
	}

	#[tokio::test]
	async fn missing_manifest_is_not_cached() {
		let source = Arc::new(CountingSource::new(None));
		let cache = MetadataCache::new(
			Arc::clone(&source) as Arc<dyn ManifestSource>,
			Duration::from_secs(60),
		);

		assert!(matches!(
			cache.get_or_fetch("1.2.3").await,
			Err(MetadataError::NotFound(_))
		));
		assert!(cache.is_empty());

		// The failed fetch must not pin the entry; the next call retries.
		let _ = cache.get_or_fetch("1.2.3").await;
		assert_eq!(source.fetch_count(), 2);
	}
}
