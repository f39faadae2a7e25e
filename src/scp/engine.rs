use super::{cecho, cfind, cmove};
use crate::aet::AeDirectory;
use crate::cache::InstanceCache;
use crate::config::{RetrieveConfig, ScpConfig};
use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::{commands, status, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, DATA_SET_MISSING};
use crate::metadata::MetadataService;
use crate::types::AE;
use crate::wado::WadoClient;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom::ul::Pdu;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

#[derive(Debug, Error)]
pub enum ScpError {
	#[error("TCP port {0} is already in use")]
	PortInUse(u16),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Shared state handed to every command handler.
pub struct ScpContext {
	pub aet: AE,
	pub max_pdu_length: u32,
	/// TCP connect bound for outbound store associations.
	pub connect_timeout: Duration,
	pub retrieve: RetrieveConfig,
	pub wado_rs_base_url: String,
	pub metadata: Arc<MetadataService>,
	pub instance_cache: Arc<InstanceCache>,
	pub wado: Arc<WadoClient>,
	pub ae_directory: Arc<AeDirectory>,
}

/// The DIMSE acceptor: binds the SCP port, caps concurrent associations and
/// dispatches incoming commands.
pub struct ScpEngine {
	config: ScpConfig,
	context: Arc<ScpContext>,
	running: AtomicBool,
	acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl ScpEngine {
	pub fn new(config: ScpConfig, context: Arc<ScpContext>) -> Self {
		Self {
			config,
			context,
			running: AtomicBool::new(false),
			acceptor: Mutex::new(None),
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// Binds the configured port and spawns the acceptor. Calling `start` on
	/// a running engine is a no-op.
	///
	/// # Errors
	/// [`ScpError::PortInUse`] when the bind address is taken; any other bind
	/// failure bubbles up unchanged.
	pub async fn start(&self) -> Result<(), ScpError> {
		if self.is_running() {
			warn!("SCP engine is already running, ignoring start request");
			return Ok(());
		}

		let address = SocketAddr::from((self.config.interface, self.config.port));
		let listener = TcpListener::bind(&address).await.map_err(|err| {
			if err.kind() == ErrorKind::AddrInUse {
				ScpError::PortInUse(self.config.port)
			} else {
				ScpError::Io(err)
			}
		})?;

		info!(
			aet = self.config.aet,
			%address,
			"Started DIMSE SCP"
		);

		let context = Arc::clone(&self.context);
		let config = self.config.clone();
		let handle = tokio::spawn(Self::accept_loop(listener, config, context));

		*self.acceptor.lock().expect("acceptor lock poisoned") = Some(handle);
		self.running.store(true, Ordering::SeqCst);
		Ok(())
	}

	/// Unbinds the port and stops accepting associations. Idempotent.
	pub fn stop(&self) {
		if !self.running.swap(false, Ordering::SeqCst) {
			warn!("SCP engine is not running, ignoring stop request");
			return;
		}
		if let Some(handle) = self
			.acceptor
			.lock()
			.expect("acceptor lock poisoned")
			.take()
		{
			handle.abort();
		}
		info!("Stopped DIMSE SCP");
	}

	async fn accept_loop(listener: TcpListener, config: ScpConfig, context: Arc<ScpContext>) {
		let limiter = Arc::new(Semaphore::new(config.max_associations));
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
						warn!(
							peer = peer.to_string(),
							"Maximum concurrent associations reached, dropping connection"
						);
						drop(stream);
						continue;
					};

					let span = info_span!("DIMSE-SCP", aet = config.aet, peer = peer.to_string());
					info!(parent: &span, "Accepted incoming connection");
					let context = Arc::clone(&context);
					let config = config.clone();
					tokio::spawn(
						async move {
							let _permit = permit;
							if let Err(err) = Self::process(stream, config, context).await {
								error!("{err}");
							}
						}
						.instrument(span),
					);
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			}
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		config: ScpConfig,
		context: Arc<ScpContext>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// The `dicom-rs` crate does not use non-blocking reads/writes. The
		// actual reading/writing happens in ServerAssociation, which moves IO
		// operations to another thread.
		tcp_stream.set_nonblocking(false)?;

		let association = ServerAssociation::new(ServerAssociationOptions {
			aet: config.aet.clone(),
			max_pdu_length: config.max_pdu_length,
			tcp_stream,
		})
		.await?;

		let timeout = config.association_timeout_duration();

		loop {
			// Idle associations may stay open between commands.
			let message = match association.read_message(Duration::MAX).await {
				Ok(message) => message,
				Err(ReadError::Released) => {
					debug!("Received A-RELEASE-RQ, releasing association");
					association.send(Pdu::ReleaseRP, timeout).await?;
					break;
				}
				Err(ReadError::Aborted) => {
					debug!("Peer aborted the association");
					break;
				}
				Err(err) => {
					debug!("Association ended: {err}");
					break;
				}
			};

			match message.command_field() {
				Some(commands::C_ECHO_RQ) => {
					cecho::handle(&association, &message, timeout).await?;
				}
				Some(commands::C_FIND_RQ) => {
					cfind::handle(&context, &association, message, timeout).await?;
				}
				Some(commands::C_MOVE_RQ) => {
					cmove::handle(&context, &association, message, timeout).await?;
				}
				command_field => {
					warn!(?command_field, "Unsupported command, rejecting");
					association
						.write_message(
							unrecognized_operation(&message),
							message.presentation_context_id,
							timeout,
						)
						.await?;
				}
			}
		}
		Ok(())
	}
}

/// Generic failure response for commands outside this SCP's services.
fn unrecognized_operation(message: &DicomMessage) -> DicomMessage {
	let response_field = message.command_field().unwrap_or(0) | 0x8000;
	let command = InMemDicomObject::command_from_element_iter([
		DataElement::new(
			tags::COMMAND_FIELD,
			VR::US,
			dicom_value!(U16, [response_field]),
		),
		DataElement::new(
			tags::MESSAGE_ID_BEING_RESPONDED_TO,
			VR::US,
			dicom_value!(U16, [message.message_id()]),
		),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			dicom_value!(U16, [DATA_SET_MISSING]),
		),
		DataElement::new(
			tags::STATUS,
			VR::US,
			dicom_value!(U16, [status::UNRECOGNIZED_OPERATION]),
		),
	]);

	DicomMessage {
		command,
		data: None,
		presentation_context_id: None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unrecognized_response_mirrors_command_field() {
		let request = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0010])),
				DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [7])),
			]),
			data: None,
			presentation_context_id: Some(1),
		};

		let response = unrecognized_operation(&request);
		assert_eq!(response.command_field(), Some(0x8010));
		assert_eq!(
			response.int_attribute(tags::MESSAGE_ID_BEING_RESPONDED_TO),
			Some(7)
		);
		assert_eq!(
			response.int_attribute(tags::STATUS),
			Some(status::UNRECOGNIZED_OPERATION)
		);
	}
}
