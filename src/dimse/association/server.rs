use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, NegotiatedContext, Sender};
use crate::types::AE;
use dicom::dictionary_std::uids;
use dicom::ul::pdu::Pdu;
use std::convert::identity;
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Abstract syntaxes this SCP provides.
const ABSTRACT_SYNTAXES: [&str; 5] = [
	uids::VERIFICATION,
	uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
	uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
	uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
	uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
];

/// Transfer syntaxes offered for every presentation context.
const TRANSFER_SYNTAXES: [&str; 3] = [
	uids::IMPLICIT_VR_LITTLE_ENDIAN,
	uids::EXPLICIT_VR_LITTLE_ENDIAN,
	uids::EXPLICIT_VR_BIG_ENDIAN,
];

/// An accepted inbound association. The blocking socket lives on its own
/// thread; callers talk to it through the command channel.
#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<NegotiatedContext>,
	calling_aet: AE,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	pub aet: AE,
	pub max_pdu_length: u32,
	pub tcp_stream: TcpStream,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.accept_any()
			.ae_title(options.aet.clone())
			.max_pdu_length(options.max_pdu_length);

		for uid in ABSTRACT_SYNTAXES {
			server_options = server_options.with_abstract_syntax(uid);
		}
		for uid in TRANSFER_SYNTAXES {
			server_options = server_options.with_transfer_syntax(uid);
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let _handle = thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span = tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						info!(
							calling_aet = association.client_ae_title(),
							called_aet = options.aet,
							"Established new server association"
						);

						let calling_aet = AE::from(association.client_ae_title());
						let pcs = association
							.presentation_contexts()
							.iter()
							.map(|pctx| NegotiatedContext {
								id: pctx.id,
								transfer_syntax: pctx.transfer_syntax.clone(),
							})
							.collect::<Vec<_>>();

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream::clone");

						connect_tx
							.send(Ok((stream, pcs, calling_aet)))
							.map_err(|_value| ())?;
						association
					}
					Err(e) => {
						connect_tx
							.send(Err(AssociationError::Server(e)))
							.map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							let send_result =
								association.send(&pdu).map_err(AssociationError::Server);
							response
								.send(send_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let receive_result =
								association.receive().map_err(AssociationError::Server);
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(e) = association.abort() {
					// Expected when the peer already closed the TCP stream.
					debug!("ServerAssociation.abort() returned error: {e}");
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_aet) =
			connect_result.await.expect("connect_result.await")?;

		Ok(Self {
			channel: tx,
			presentation_contexts,
			calling_aet,
			tcp_stream,
		})
	}

	/// AE title of the peer that opened this association.
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			warn!("TcpStream::shutdown failed: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[NegotiatedContext] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}
