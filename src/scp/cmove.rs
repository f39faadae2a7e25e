//! C-MOVE orchestrator: resolves the destination, groups the requested
//! instances into `(series, SOP class)` buckets and runs one download→store
//! pipeline per bucket over a single reused outbound association.
//!
//! Progress responses are written exclusively by the handler task; download
//! and store workers report sub-operation outcomes over a channel.

use super::cstore::{store_instance, MoveOriginator};
use super::engine::ScpContext;
use crate::cache::InstanceCache;
use crate::dimse::association::client::{ClientAssociation, ClientAssociationOptions};
use crate::dimse::association::server::ServerAssociation;
use crate::dimse::{
	commands, status, DicomMessage, DicomMessageWriter, WriteError, DATA_SET_MISSING,
};
use crate::metadata::{InstanceMetadata, StudyMetadata};
use crate::types::{UI, US};
use crate::wado::{decode_instance, ensure_part10, RetrieveError, WadoClient};
use bytes::Bytes;
use dicom::core::{DataElement, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Wait for the first instance of a bucket before giving up on it.
const FIRST_INSTANCE_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period for the download pool to drain after the bucket is done.
const DOWNLOAD_POOL_GRACE: Duration = Duration::from_secs(300);
/// Grace period for the store pool to finish outstanding responses.
const STORE_POOL_GRACE: Duration = Duration::from_secs(120);

/// Instances sharing one key are sent over a single outbound association.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationKey {
	pub series_instance_uid: UI,
	pub sop_class_uid: UI,
}

/// A downloaded instance travelling through the bounded queue. Ownership
/// transfers to the store worker on dequeue.
struct DicomInstance {
	dataset: FileDicomObject<InMemDicomObject>,
	sop_class_uid: UI,
	sop_instance_uid: UI,
	transfer_syntax: UI,
}

/// Outcome of one sub-operation, reported to the progress writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubOperation {
	Completed,
	Failed,
}

/// Aggregated result of one C-MOVE request.
#[derive(Debug, Clone, Default)]
pub struct MoveOutcome {
	pub total: usize,
	pub completed: usize,
	pub failed: usize,
	pub warnings: Vec<String>,
}

impl MoveOutcome {
	pub const fn success(&self) -> bool {
		self.failed == 0
	}

	const fn remaining(&self) -> usize {
		self.total - self.completed - self.failed
	}
}

/// C-MOVE-RSP
struct MoveResponse {
	message_id: US,
	affected_sop_class_uid: UI,
	status: US,
	counters: Option<MoveCounters>,
}

#[derive(Debug, Clone, Copy)]
struct MoveCounters {
	remaining: US,
	completed: US,
	failed: US,
	warnings: US,
}

impl From<MoveResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: MoveResponse) -> Self {
        let mut command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.affected_sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [commands::C_MOVE_RSP])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
        ]);

        if let Some(counters) = response.counters {
            command.put_element(DataElement::new(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, VR::US, dicom_value!(U16, [counters.remaining])));
            command.put_element(DataElement::new(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, VR::US, dicom_value!(U16, [counters.completed])));
            command.put_element(DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, dicom_value!(U16, [counters.failed])));
            command.put_element(DataElement::new(tags::NUMBER_OF_WARNING_SUBOPERATIONS, VR::US, dicom_value!(U16, [counters.warnings])));
        }

        Self {
            command,
            data: None,
            presentation_context_id: None,
        }
    }
}

fn counters_of(outcome: &MoveOutcome) -> MoveCounters {
	MoveCounters {
		remaining: clamp_us(outcome.remaining()),
		completed: clamp_us(outcome.completed),
		failed: clamp_us(outcome.failed),
		warnings: 0,
	}
}

fn clamp_us(value: usize) -> US {
	US::try_from(value).unwrap_or(US::MAX)
}

pub async fn handle(
	context: &ScpContext,
	association: &ServerAssociation,
	message: DicomMessage,
	timeout: Duration,
) -> Result<(), WriteError> {
	let message_id = message.message_id();
	let affected_sop_class_uid = message
		.str_attribute(tags::AFFECTED_SOP_CLASS_UID)
		.unwrap_or_else(|| UI::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE));
	let presentation_context_id = message.presentation_context_id;

	let respond = |status: US, counters: Option<MoveCounters>| MoveResponse {
		message_id,
		affected_sop_class_uid: affected_sop_class_uid.clone(),
		status,
		counters,
	};

	let Some(destination) = message.str_attribute(tags::MOVE_DESTINATION) else {
		warn!("C-MOVE-RQ without MoveDestination");
		return association
			.write_message(
				respond(status::INVALID_ARGUMENT_VALUE, None),
				presentation_context_id,
				timeout,
			)
			.await;
	};

	let identifier = message.data.unwrap_or_else(InMemDicomObject::new_empty);
	let study_instance_uid = string_of(&identifier, tags::STUDY_INSTANCE_UID);
	let Some(study_instance_uid) = study_instance_uid else {
		warn!("C-MOVE-RQ without StudyInstanceUID");
		return association
			.write_message(
				respond(status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS, None),
				presentation_context_id,
				timeout,
			)
			.await;
	};

	let Some(target) = context.ae_directory.resolve(&destination) else {
		warn!(destination, "Unknown move destination");
		return association
			.write_message(
				respond(status::MOVE_DESTINATION_UNKNOWN, None),
				presentation_context_id,
				timeout,
			)
			.await;
	};

	let study = match context.metadata.cache().get_or_fetch(&study_instance_uid).await {
		Ok(study) => study,
		Err(err) => {
			warn!(study_instance_uid, "C-MOVE study lookup failed: {err}");
			return association
				.write_message(
					respond(status::UNABLE_TO_PROCESS, None),
					presentation_context_id,
					timeout,
				)
				.await;
		}
	};

	let series_instance_uid = string_of(&identifier, tags::SERIES_INSTANCE_UID);
	let sop_instance_uid = string_of(&identifier, tags::SOP_INSTANCE_UID);

	let instances = select_instances(
		&study,
		series_instance_uid.as_deref(),
		sop_instance_uid.as_deref(),
	);
	let expected = expected_count(
		&study,
		series_instance_uid.as_deref(),
		sop_instance_uid.as_deref(),
	);

	info!(
		study_instance_uid,
		destination,
		host = target.host,
		port = target.port,
		expected,
		"Starting C-MOVE"
	);

	let mut outcome = MoveOutcome {
		total: expected,
		..MoveOutcome::default()
	};

	association
		.write_message(
			respond(status::PENDING, Some(counters_of(&outcome))),
			presentation_context_id,
			timeout,
		)
		.await?;

	let originator = MoveOriginator {
		aet: UI::from(association.calling_aet()),
		message_id,
	};
	let buckets = group_by_association_key(instances);

	let (events_tx, mut events_rx) = mpsc::channel::<SubOperation>(32);
	let pipeline = {
		let context = PipelineContext {
			wado: Arc::clone(&context.wado),
			instance_cache: Arc::clone(&context.instance_cache),
			calling_aet: context.aet.clone(),
			called_aet: destination.clone(),
			peer: format!("{}:{}", target.host, target.port),
			max_pdu_length: context.max_pdu_length,
			connect_timeout: context.connect_timeout,
			max_parallel_downloads: context.retrieve.max_parallel_downloads,
			max_parallel_stores: context.retrieve.max_parallel_stores,
			wado_rs_base_url: context.wado_rs_base_url.clone(),
			store_timeout: timeout,
			originator,
		};
		tokio::spawn(
			process_buckets(context, buckets, events_tx)
				.instrument(info_span!("cmove-pipeline", study = study_instance_uid)),
		)
	};

	// Single writer: every sub-operation outcome becomes one Pending response.
	while let Some(event) = events_rx.recv().await {
		match event {
			SubOperation::Completed => outcome.completed += 1,
			SubOperation::Failed => outcome.failed += 1,
		}
		if outcome.completed + outcome.failed > outcome.total {
			// Expected count and bucket contents disagree; widen the total so
			// the counters stay consistent.
			outcome.total = outcome.completed + outcome.failed;
		}
		debug!(
			completed = outcome.completed,
			failed = outcome.failed,
			remaining = outcome.remaining(),
			"Sending C-MOVE pending response"
		);
		association
			.write_message(
				respond(status::PENDING, Some(counters_of(&outcome))),
				presentation_context_id,
				timeout,
			)
			.await?;
	}

	if let Err(err) = pipeline.await {
		warn!("C-MOVE pipeline task failed: {err}");
	}

	// Sub-operations that never produced an outcome count as failed.
	outcome.failed += outcome.remaining();

	let final_status = if outcome.success() {
		status::SUCCESS
	} else {
		status::UNABLE_TO_PROCESS
	};
	info!(
		completed = outcome.completed,
		failed = outcome.failed,
		"Sending C-MOVE final response"
	);
	association
		.write_message(
			respond(final_status, Some(counters_of(&outcome))),
			presentation_context_id,
			timeout,
		)
		.await
}

/// All study instances matching the optional series/SOP filters, in series order.
fn select_instances(
	study: &StudyMetadata,
	series_instance_uid: Option<&str>,
	sop_instance_uid: Option<&str>,
) -> Vec<InstanceMetadata> {
	study
		.series
		.iter()
		.filter(|series| {
			series_instance_uid.is_none_or(|filter| series.series_instance_uid == filter)
		})
		.flat_map(|series| series.instances.iter())
		.filter(|instance| {
			sop_instance_uid.is_none_or(|filter| instance.sop_instance_uid == filter)
		})
		.cloned()
		.collect()
}

/// Expected sub-operation count, by request granularity.
fn expected_count(
	study: &StudyMetadata,
	series_instance_uid: Option<&str>,
	sop_instance_uid: Option<&str>,
) -> usize {
	if sop_instance_uid.is_some() {
		return 1;
	}
	if let Some(series_instance_uid) = series_instance_uid {
		return study
			.series_by_uid(series_instance_uid)
			.map_or(0, |series| series.instances.len());
	}
	study.study_related_instances_count
}

/// Buckets the instances by `(series, SOP class)` preserving insertion order.
fn group_by_association_key(
	instances: Vec<InstanceMetadata>,
) -> Vec<(AssociationKey, Vec<InstanceMetadata>)> {
	let mut buckets: Vec<(AssociationKey, Vec<InstanceMetadata>)> = Vec::new();
	for instance in instances {
		let key = AssociationKey {
			series_instance_uid: instance.series_instance_uid.clone(),
			sop_class_uid: instance.sop_class_uid.clone(),
		};
		match buckets.iter_mut().find(|(existing, _)| *existing == key) {
			Some((_, bucket)) => bucket.push(instance),
			None => buckets.push((key, vec![instance])),
		}
	}
	buckets
}

/// Everything the pipeline tasks need, detached from the handler's borrows.
struct PipelineContext {
	wado: Arc<WadoClient>,
	instance_cache: Arc<InstanceCache>,
	calling_aet: UI,
	called_aet: UI,
	peer: String,
	max_pdu_length: u32,
	connect_timeout: Duration,
	max_parallel_downloads: usize,
	max_parallel_stores: usize,
	wado_rs_base_url: String,
	store_timeout: Duration,
	originator: MoveOriginator,
}

/// Buckets are processed strictly one at a time; a failing bucket never
/// aborts the ones after it.
async fn process_buckets(
	context: PipelineContext,
	buckets: Vec<(AssociationKey, Vec<InstanceMetadata>)>,
	events: mpsc::Sender<SubOperation>,
) {
	for (key, bucket) in buckets {
		let span = info_span!(
			"bucket",
			series = key.series_instance_uid,
			sop_class = key.sop_class_uid
		);
		process_bucket(&context, &key, bucket, &events)
			.instrument(span)
			.await;
	}
}

async fn process_bucket(
	context: &PipelineContext,
	key: &AssociationKey,
	bucket: Vec<InstanceMetadata>,
	events: &mpsc::Sender<SubOperation>,
) {
	let bucket_size = bucket.len();
	// Every instance in the bucket must produce exactly one outcome event;
	// this counter backstops the paths that bail out early.
	let emitted = Arc::new(AtomicUsize::new(0));

	let queue_capacity = 2 * context.max_parallel_stores;
	let (queue_tx, queue_rx) = mpsc::channel::<DicomInstance>(queue_capacity);
	let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

	let work = Arc::new(std::sync::Mutex::new(VecDeque::from(bucket)));
	let download_pool = context.max_parallel_downloads.min(bucket_size).max(1);

	let mut downloads = Vec::with_capacity(download_pool);
	for _ in 0..download_pool {
		let work = Arc::clone(&work);
		let queue_tx = queue_tx.clone();
		let events = events.clone();
		let emitted = Arc::clone(&emitted);
		let wado = Arc::clone(&context.wado);
		let instance_cache = Arc::clone(&context.instance_cache);
		let wado_rs_base_url = context.wado_rs_base_url.clone();

		downloads.push(tokio::spawn(async move {
			loop {
				// The originating association is gone; abandon the work.
				if events.is_closed() {
					break;
				}
				let next = {
					let mut work = work.lock().expect("download work list poisoned");
					work.pop_front()
				};
				let Some(instance) = next else {
					break;
				};

				match download_instance(&wado, &instance_cache, &wado_rs_base_url, &instance).await
				{
					Ok(downloaded) => {
						// Blocks when the queue is full: back-pressure towards
						// the store pool.
						if queue_tx.send(downloaded).await.is_err() {
							break;
						}
					}
					Err(err) => {
						warn!(
							sop_instance_uid = instance.sop_instance_uid,
							"Download failed: {err}"
						);
						emitted.fetch_add(1, Ordering::SeqCst);
						if events.send(SubOperation::Failed).await.is_err() {
							break;
						}
					}
				}
			}
		}));
	}
	// The workers hold the remaining senders; the queue closes once they are done.
	drop(queue_tx);

	store_bucket(context, key, &queue_rx, events, &emitted).await;

	if tokio::time::timeout(DOWNLOAD_POOL_GRACE, futures::future::join_all(&mut downloads))
		.await
		.is_err()
	{
		warn!("Download pool did not drain in time, aborting it");
		for download in &downloads {
			download.abort();
		}
	}

	// Anything that never produced an outcome is a failure.
	let leftover = bucket_size.saturating_sub(emitted.load(Ordering::SeqCst));
	for _ in 0..leftover {
		if events.send(SubOperation::Failed).await.is_err() {
			break;
		}
	}
	info!(
		size = bucket_size,
		unaccounted = leftover,
		"Bucket processed"
	);
}

/// Consumes the queue for one bucket: learns the transfer syntax from the
/// first instance, opens the association and runs the store pool.
async fn store_bucket(
	context: &PipelineContext,
	key: &AssociationKey,
	queue_rx: &Arc<tokio::sync::Mutex<mpsc::Receiver<DicomInstance>>>,
	events: &mpsc::Sender<SubOperation>,
	emitted: &Arc<AtomicUsize>,
) {
	let first = {
		let mut receiver = queue_rx.lock().await;
		match tokio::time::timeout(FIRST_INSTANCE_TIMEOUT, receiver.recv()).await {
			Ok(Some(instance)) => instance,
			Ok(None) => return, // nothing downloaded; failures already reported
			Err(_) => {
				warn!("Timed out waiting for the first instance of the bucket");
				return;
			}
		}
	};

	// The original transfer syntax is known now; propose exactly it.
	let association = tokio::time::timeout(
		context.connect_timeout,
		ClientAssociation::new(ClientAssociationOptions {
			calling_aet: context.calling_aet.clone(),
			called_aet: context.called_aet.clone(),
			abstract_syntax: key.sop_class_uid.clone(),
			transfer_syntax: first.transfer_syntax.clone(),
			max_pdu_length: context.max_pdu_length,
			peer: context.peer.clone(),
		}),
	)
	.await
	.map_err(|_| RetrieveError::Timeout("store association establishment"));

	let association = match association {
		Ok(association) => association,
		Err(err) => {
			warn!("{err}");
			fail_instance(events, emitted).await;
			drain_as_failures(queue_rx, events, emitted).await;
			return;
		}
	};

	let association = match association {
		Ok(association) if association.negotiated().is_some() => Arc::new(association),
		Ok(_) => {
			let err = RetrieveError::PresentationContextRejected {
				sop_class_uid: key.sop_class_uid.clone(),
			};
			warn!(
				transfer_syntax = first.transfer_syntax,
				"{err}, failing bucket"
			);
			fail_instance(events, emitted).await;
			drain_as_failures(queue_rx, events, emitted).await;
			return;
		}
		Err(err) => {
			warn!("Failed to open store association: {err}");
			fail_instance(events, emitted).await;
			drain_as_failures(queue_rx, events, emitted).await;
			return;
		}
	};

	// DIMSE messages on one association must not interleave; each store
	// holds this lock across its request/response pair.
	let store_lock = Arc::new(tokio::sync::Mutex::new(()));

	report_store(
		store_first(context, &association, &store_lock, first).await,
		events,
		emitted,
	)
	.await;

	let mut workers = Vec::with_capacity(context.max_parallel_stores);
	for _ in 0..context.max_parallel_stores {
		let association = Arc::clone(&association);
		let store_lock = Arc::clone(&store_lock);
		let queue_rx = Arc::clone(queue_rx);
		let events = events.clone();
		let emitted = Arc::clone(emitted);
		let originator = context.originator.clone();
		let timeout = context.store_timeout;

		workers.push(tokio::spawn(async move {
			loop {
				if events.is_closed() {
					break;
				}
				let next = {
					let mut receiver = queue_rx.lock().await;
					receiver.recv().await
				};
				let Some(instance) = next else {
					break;
				};

				let success = {
					let _guard = store_lock.lock().await;
					store_instance(
						&association,
						&instance.sop_class_uid,
						&instance.sop_instance_uid,
						instance.dataset.into_inner(),
						&originator,
						timeout,
					)
					.await
				};
				report_store(success, &events, &emitted).await;
			}
		}));
	}

	if tokio::time::timeout(STORE_POOL_GRACE, futures::future::join_all(&mut workers))
		.await
		.is_err()
	{
		warn!("Store pool did not finish in time, aborting it");
		for worker in &workers {
			worker.abort();
		}
	}
	// Dropping the association releases it on the I/O thread.
}

async fn store_first(
	context: &PipelineContext,
	association: &ClientAssociation,
	store_lock: &tokio::sync::Mutex<()>,
	instance: DicomInstance,
) -> bool {
	let _guard = store_lock.lock().await;
	store_instance(
		association,
		&instance.sop_class_uid,
		&instance.sop_instance_uid,
		instance.dataset.into_inner(),
		&context.originator,
		context.store_timeout,
	)
	.await
}

async fn report_store(
	success: bool,
	events: &mpsc::Sender<SubOperation>,
	emitted: &Arc<AtomicUsize>,
) {
	emitted.fetch_add(1, Ordering::SeqCst);
	let outcome = if success {
		SubOperation::Completed
	} else {
		SubOperation::Failed
	};
	let _ = events.send(outcome).await;
}

async fn fail_instance(events: &mpsc::Sender<SubOperation>, emitted: &Arc<AtomicUsize>) {
	emitted.fetch_add(1, Ordering::SeqCst);
	let _ = events.send(SubOperation::Failed).await;
}

/// Counts every queued instance as failed until the queue closes.
async fn drain_as_failures(
	queue_rx: &Arc<tokio::sync::Mutex<mpsc::Receiver<DicomInstance>>>,
	events: &mpsc::Sender<SubOperation>,
	emitted: &Arc<AtomicUsize>,
) {
	loop {
		let next = {
			let mut receiver = queue_rx.lock().await;
			receiver.recv().await
		};
		if next.is_none() {
			break;
		}
		fail_instance(events, emitted).await;
	}
}

/// Fetches one instance, via the byte cache when possible, and decodes it
/// together with its original transfer syntax.
async fn download_instance(
	wado: &WadoClient,
	instance_cache: &InstanceCache,
	wado_rs_base_url: &str,
	instance: &InstanceMetadata,
) -> Result<DicomInstance, RetrieveError> {
	let sop_instance_uid = &instance.sop_instance_uid;

	let bytes = if let Some(cached) = instance_cache.get(sop_instance_uid) {
		debug!(sop_instance_uid, "Instance served from cache");
		cached
	} else {
		let url = instance_url(wado_rs_base_url, instance);
		let blobs = wado.retrieve(&url).await?;

		// A multipart response may carry several instances; cache each under
		// its own SOP Instance UID and forward the one that was asked for.
		let mut matching: Option<Bytes> = None;
		let mut fallback: Option<Bytes> = None;
		for blob in blobs {
			ensure_part10(&blob)?;
			let decoded = decode_instance(&blob)?;
			let blob_sop_uid = decoded
				.meta()
				.media_storage_sop_instance_uid
				.trim_end_matches('\0')
				.to_owned();
			instance_cache.put(&blob_sop_uid, blob.clone());
			if blob_sop_uid == *sop_instance_uid {
				matching = Some(blob);
			} else if fallback.is_none() {
				fallback = Some(blob);
			}
		}
		matching.or(fallback).ok_or(RetrieveError::EmptyResponse)?
	};

	let dataset = decode_instance(&bytes)?;
	let transfer_syntax = dataset.meta().transfer_syntax().to_owned();

	Ok(DicomInstance {
		sop_class_uid: instance.sop_class_uid.clone(),
		sop_instance_uid: sop_instance_uid.clone(),
		transfer_syntax,
		dataset,
	})
}

/// Per-instance WADO-RS URL; derived from the configured base when the
/// manifest carried none.
fn instance_url(wado_rs_base_url: &str, instance: &InstanceMetadata) -> String {
	instance.retrieve_url.clone().unwrap_or_else(|| {
		format!(
			"{}/studies/{}/series/{}/instances/{}",
			wado_rs_base_url.trim_end_matches('/'),
			instance.study_instance_uid,
			instance.series_instance_uid,
			instance.sop_instance_uid
		)
	})
}

fn string_of(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	object
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim().to_owned())
		.filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metadata::SeriesMetadata;

	fn instance(series: &str, sop_class: &str, sop: &str) -> InstanceMetadata {
		InstanceMetadata {
			study_instance_uid: UI::from("1.2.3.4.5.6.7.8.2"),
			series_instance_uid: UI::from(series),
			sop_instance_uid: UI::from(sop),
			sop_class_uid: UI::from(sop_class),
			..InstanceMetadata::default()
		}
	}

	fn study() -> StudyMetadata {
		let ct = SeriesMetadata {
			study_instance_uid: UI::from("1.2.3.4.5.6.7.8.2"),
			series_instance_uid: UI::from("1.2.3.4.5.6.7.8.3"),
			modality: Some(String::from("CT")),
			instances: vec![instance(
				"1.2.3.4.5.6.7.8.3",
				"1.2.840.10008.5.1.4.1.1.2",
				"1.2.3.4.5.6.7.8.10",
			)],
			..SeriesMetadata::default()
		};
		let mr = SeriesMetadata {
			study_instance_uid: UI::from("1.2.3.4.5.6.7.8.2"),
			series_instance_uid: UI::from("1.2.3.4.5.6.7.8.100"),
			modality: Some(String::from("MR")),
			instances: vec![
				instance(
					"1.2.3.4.5.6.7.8.100",
					"1.2.840.10008.5.1.4.1.1.4",
					"1.2.3.4.5.6.7.8.11",
				),
				instance(
					"1.2.3.4.5.6.7.8.100",
					"1.2.840.10008.5.1.4.1.1.4",
					"1.2.3.4.5.6.7.8.12",
				),
			],
			..SeriesMetadata::default()
		};
		let mut study = StudyMetadata {
			study_instance_uid: UI::from("1.2.3.4.5.6.7.8.2"),
			series: vec![ct, mr],
			..StudyMetadata::default()
		};
		study.finalize();
		study
	}

	#[test]
	fn buckets_preserve_insertion_order() {
		let study = study();
		let instances = select_instances(&study, None, None);
		let buckets = group_by_association_key(instances);

		assert_eq!(buckets.len(), 2);
		assert_eq!(buckets[0].0.sop_class_uid, "1.2.840.10008.5.1.4.1.1.2");
		assert_eq!(buckets[0].1.len(), 1);
		assert_eq!(buckets[1].0.sop_class_uid, "1.2.840.10008.5.1.4.1.1.4");
		assert_eq!(buckets[1].1.len(), 2);
	}

	#[test]
	fn expected_count_by_granularity() {
		let study = study();
		assert_eq!(expected_count(&study, None, None), 3);
		assert_eq!(expected_count(&study, Some("1.2.3.4.5.6.7.8.100"), None), 2);
		assert_eq!(
			expected_count(&study, Some("1.2.3.4.5.6.7.8.100"), Some("1.2.3.4.5.6.7.8.12")),
			1
		);
		assert_eq!(expected_count(&study, Some("unknown"), None), 0);
	}

	#[test]
	fn series_filter_selects_matching_instances() {
		let study = study();
		let instances = select_instances(&study, Some("1.2.3.4.5.6.7.8.100"), None);
		assert_eq!(instances.len(), 2);
		assert!(instances
			.iter()
			.all(|instance| instance.series_instance_uid == "1.2.3.4.5.6.7.8.100"));
	}

	#[test]
	fn instance_url_falls_back_to_base() {
		let meta = instance("1.2.3.4.5.6.7.8.3", "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4.5.6.7.8.10");
		assert_eq!(
			instance_url("http://pacs/wado-rs/", &meta),
			"http://pacs/wado-rs/studies/1.2.3.4.5.6.7.8.2/series/1.2.3.4.5.6.7.8.3/instances/1.2.3.4.5.6.7.8.10"
		);

		let with_url = InstanceMetadata {
			retrieve_url: Some(String::from("http://pacs/explicit")),
			..meta
		};
		assert_eq!(instance_url("http://pacs/wado-rs", &with_url), "http://pacs/explicit");
	}

	#[test]
	fn outcome_counters() {
		let outcome = MoveOutcome {
			total: 3,
			completed: 2,
			failed: 1,
			warnings: Vec::new(),
		};
		assert_eq!(outcome.remaining(), 0);
		assert!(!outcome.success());

		let counters = counters_of(&outcome);
		assert_eq!(counters.remaining, 0);
		assert_eq!(counters.completed, 2);
		assert_eq!(counters.failed, 1);
	}
}
