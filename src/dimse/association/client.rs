use dicom::ul::pdu::{PDataValueType, PresentationContextResultReason};
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, ChannelError, Command, NegotiatedContext};
use crate::types::{AE, UI};

/// An outbound association proposing exactly one presentation context.
/// Used by the C-MOVE pipeline to forward instances in their original
/// transfer syntax; when the peer refuses the context,
/// [`ClientAssociation::negotiated`] returns `None`.
pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: std::net::TcpStream,
	presentation_contexts: Vec<NegotiatedContext>,
	acceptor_max_pdu_length: u32,
}

pub struct ClientAssociationOptions {
	pub calling_aet: AE,
	pub called_aet: AE,
	pub abstract_syntax: UI,
	pub transfer_syntax: UI,
	pub max_pdu_length: u32,
	/// `host:port` of the peer; name resolution happens on the I/O thread.
	pub peer: String,
}

impl ClientAssociation {
	fn chunked_send(
		association: &mut dicom::ul::ClientAssociation<std::net::TcpStream>,
		pdu: &Pdu,
	) -> Result<(), AssociationError> {
		match &pdu {
			Pdu::PData { data } => {
				let is_command = data
					.first()
					.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				if is_command {
					association.send(pdu).map_err(AssociationError::Client)
				} else {
					let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
					if data_length > association.acceptor_max_pdu_length() as usize {
						for pdv in data {
							let mut writer = association.send_pdata(pdv.presentation_context_id);
							writer
								.write_all(&pdv.data)
								.map_err(AssociationError::ChunkWriter)?;
						}
						Ok(())
					} else {
						association.send(pdu).map_err(AssociationError::Client)
					}
				}
			}
			_ => association.send(pdu).map_err(AssociationError::Client),
		}
	}

	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let peer = options.peer;
		let called_aet = options.called_aet.clone();
		let ul_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.max_pdu_length(options.max_pdu_length)
			.with_presentation_context(
				options.abstract_syntax,
				vec![options.transfer_syntax],
			);

		let _handle = thread::Builder::new()
			.name(format!("{called_aet}-client"))
			.spawn(move || {
				let mut association = match ul_options.establish_with(&peer) {
					Ok(mut association) => {
						// Only contexts the peer accepted count as negotiated.
						let presentation_contexts = association
							.presentation_contexts()
							.iter()
							.filter(|pctx| {
								pctx.reason == PresentationContextResultReason::Acceptance
							})
							.map(|pctx| NegotiatedContext {
								id: pctx.id,
								transfer_syntax: pctx.transfer_syntax.clone(),
							})
							.collect::<Vec<_>>();
						let acceptor_max_pdu_length = association.acceptor_max_pdu_length();

						info!(
							peer = peer,
							accepted = presentation_contexts.len(),
							"Established new client association"
						);

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream should be cloneable");

						connect_tx
							.send(Ok((stream, presentation_contexts, acceptor_max_pdu_length)))
							.map_err(|_| ())?;

						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx
							.send(Err(AssociationError::Client(e)))
							.map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result =
								association.receive().map_err(AssociationError::Client);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
					};
					if let Some(err) = result.err() {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in ClientAssociation backend: {err}"
						);
						return Err(());
					}
				}

				rx.close();

				// A completed bucket releases gracefully; abort is the fallback.
				if let Err(err) = association.release() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to release ClientAssociation: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, acceptor_max_pdu_length) =
			connect_result.await.expect("connect_result.await")?;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
			acceptor_max_pdu_length,
		})
	}

	pub fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	pub const fn acceptor_max_pdu_length(&self) -> u32 {
		self.acceptor_max_pdu_length
	}

	/// The single accepted presentation context, if the peer took our proposal.
	pub fn negotiated(&self) -> Option<&NegotiatedContext> {
		self.presentation_contexts.first()
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
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
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[NegotiatedContext] {
		&self.presentation_contexts
	}
}
