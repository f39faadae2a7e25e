//! DIMSE message plumbing shared by the inbound SCP engine and the outbound
//! C-STORE path: message framing over P-DATA PDUs, status handling and the
//! association abstraction.

pub mod association;

use crate::types::{UI, US};
use association::{Association, AssociationError, NegotiatedContext};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Command Data Set Type (0000,0800) value announcing that a data set
/// follows the command set. Peers may use other non-null values, so reads
/// only ever compare against [`DATA_SET_MISSING`].
pub const DATA_SET_EXISTS: US = 0x0102;
/// The DICOM NULL value: the message consists of the command set alone.
pub const DATA_SET_MISSING: US = 0x0101;

/// Command Field (0000,0100) values handled by this gateway.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_E.html>
pub mod commands {
	use crate::types::US;

	pub const C_STORE_RQ: US = 0x0001;
	pub const C_STORE_RSP: US = 0x8001;
	pub const C_FIND_RQ: US = 0x0020;
	pub const C_FIND_RSP: US = 0x8020;
	pub const C_MOVE_RQ: US = 0x0021;
	pub const C_MOVE_RSP: US = 0x8021;
	pub const C_ECHO_RQ: US = 0x0030;
	pub const C_ECHO_RSP: US = 0x8030;
}

/// Status (0000,0900) values emitted by the gateway.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
pub mod status {
	use crate::types::US;

	pub const SUCCESS: US = 0x0000;
	pub const PENDING: US = 0xFF00;
	pub const CANCEL: US = 0xFE00;
	/// A900: the identifier does not match the SOP class (e.g. a retrieve
	/// request without a Study Instance UID).
	pub const IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: US = 0xA900;
	/// A801: the move destination AE title is unknown.
	pub const MOVE_DESTINATION_UNKNOWN: US = 0xA801;
	/// C000: one or more sub-operations failed.
	pub const UNABLE_TO_PROCESS: US = 0xC000;
	/// 0110: a backend failure while matching.
	pub const PROCESSING_FAILURE: US = 0x0110;
	/// 0115: a request argument carries an invalid value.
	pub const INVALID_ARGUMENT_VALUE: US = 0x0115;
	/// 0211: the command is not one this SCP provides.
	pub const UNRECOGNIZED_OPERATION: US = 0x0211;
}

/// A DIMSE message: a command set plus the data set announced by it, tagged
/// with the presentation context it arrived on.
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"DicomMessage(command field {:#06x}, data: {})",
			self.command_field().unwrap_or(0),
			self.data.is_some()
		)
	}
}

impl DicomMessage {
	pub fn command_field(&self) -> Option<US> {
		self.int_attribute(tags::COMMAND_FIELD)
	}

	pub fn message_id(&self) -> US {
		self.int_attribute(tags::MESSAGE_ID).unwrap_or(0)
	}

	/// Parsed Status (0000,0900) of a response message. Statuses outside the
	/// ranges of Part 7 chapter C map to `None`.
	pub fn status_type(&self) -> Option<StatusType> {
		self.int_attribute(tags::STATUS)
			.and_then(|value| StatusType::try_from(value).ok())
	}

	pub fn int_attribute(&self, tag: Tag) -> Option<US> {
		self.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	pub fn str_attribute(&self, tag: Tag) -> Option<String> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.trim_end().to_owned())
			.filter(|value| !value.is_empty())
	}
}

/// Status types supported by the DIMSE services.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF | 0xC000..=0xCFFF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

/// Selects the presentation context to use: an explicit id must match a
/// negotiated context, no id means the association's only (or first) one.
fn context_for(
	contexts: &[NegotiatedContext],
	presentation_context_id: Option<u8>,
) -> Result<&NegotiatedContext, NegotiationError> {
	match presentation_context_id {
		None => contexts.first(),
		Some(id) => contexts.iter().find(|pctx| pctx.id == id),
	}
	.ok_or(NegotiationError::NoPresentationContext)
}

/// Wraps an encoded fragment into a single-PDV P-DATA PDU. The association
/// layer re-chunks data that exceeds the acceptor's maximum PDU length.
fn pdata(presentation_context_id: u8, value_type: PDataValueType, data: Vec<u8>) -> Pdu {
	Pdu::PData {
		data: vec![PDataValue {
			value_type,
			presentation_context_id,
			is_last: true,
			data,
		}],
	}
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = message.into();
		let pctx = context_for(self.presentation_contexts(), presentation_context_id)?;
		let pctx_id = pctx.id;

		// Command sets always travel in Implicit VR LE; only the data set
		// uses the negotiated transfer syntax.
		let mut pdus = Vec::with_capacity(2);
		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		pdus.push(pdata(pctx_id, PDataValueType::Command, command_buf));

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&pctx.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(&pctx.transfer_syntax))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;
			pdus.push(pdata(pctx_id, PDataValueType::Data, data_buf));
		}

		for pdu in pdus {
			self.send(pdu, timeout).await?;
		}
		Ok(())
	}
}

/// Reassembles one DIMSE message from a stream of P-DATA values.
///
/// Out-of-order fragments are rejected as soon as they appear: a second
/// command set on one message, or data arriving while no command set
/// announced it.
#[derive(Default)]
struct MessageAssembly {
	command_fragments: Vec<u8>,
	data_fragments: Vec<u8>,
	command: Option<InMemDicomObject>,
}

enum AssemblyStep {
	Incomplete,
	CommandOnly(InMemDicomObject, u8),
	WithData(InMemDicomObject, Vec<u8>, u8),
}

impl MessageAssembly {
	fn push(&mut self, mut pdv: PDataValue) -> Result<AssemblyStep, ReadError> {
		match pdv.value_type {
			PDataValueType::Command => {
				if self.command.is_some() {
					return Err(ReadError::OutOfOrder);
				}
				trace!("Received command fragment (last={})", pdv.is_last);
				self.command_fragments.append(&mut pdv.data);
				if !pdv.is_last {
					return Ok(AssemblyStep::Incomplete);
				}

				let command = InMemDicomObject::read_dataset_with_ts(
					self.command_fragments.as_slice(),
					&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
				)?;
				if Self::announces_data_set(&command) {
					self.command = Some(command);
					Ok(AssemblyStep::Incomplete)
				} else {
					Ok(AssemblyStep::CommandOnly(
						command,
						pdv.presentation_context_id,
					))
				}
			}
			PDataValueType::Data => {
				if self.command.is_none() {
					return Err(ReadError::OutOfOrder);
				}
				trace!("Received data fragment (last={})", pdv.is_last);
				self.data_fragments.append(&mut pdv.data);
				if !pdv.is_last {
					return Ok(AssemblyStep::Incomplete);
				}

				let command = self.command.take().ok_or(ReadError::OutOfOrder)?;
				Ok(AssemblyStep::WithData(
					command,
					std::mem::take(&mut self.data_fragments),
					pdv.presentation_context_id,
				))
			}
		}
	}

	fn announces_data_set(command: &InMemDicomObject) -> bool {
		command
			.get(tags::COMMAND_DATA_SET_TYPE)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.is_some_and(|value| value != DATA_SET_MISSING)
	}
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut assembly = MessageAssembly::default();

		loop {
			match self.receive(timeout).await? {
				Pdu::PData { data } => {
					for pdv in data {
						match assembly.push(pdv)? {
							AssemblyStep::Incomplete => {}
							AssemblyStep::CommandOnly(command, pctx_id) => {
								return Ok(DicomMessage {
									command,
									data: None,
									presentation_context_id: Some(pctx_id),
								});
							}
							AssemblyStep::WithData(command, fragments, pctx_id) => {
								let pctx =
									context_for(self.presentation_contexts(), Some(pctx_id))?;
								let transfer_syntax = TransferSyntaxRegistry
									.get(&pctx.transfer_syntax)
									.ok_or_else(|| {
										NegotiationError::UnknownTransferSyntax(UI::from(
											&pctx.transfer_syntax,
										))
									})?;
								let data = InMemDicomObject::read_dataset_with_ts(
									fragments.as_slice(),
									transfer_syntax,
								)?;
								return Ok(DicomMessage {
									command,
									data: Some(data),
									presentation_context_id: Some(pctx_id),
								});
							}
						}
					}
				}
				// Association lifecycle PDUs surface as distinct outcomes so
				// the engine can answer a release and drop on an abort.
				Pdu::ReleaseRQ => return Err(ReadError::Released),
				Pdu::AbortRQ { .. } => return Err(ReadError::Aborted),
				pdu => return Err(ReadError::UnexpectedPdu(Box::new(pdu))),
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Box<Pdu>),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Peer requested release of the association")]
	Released,
	#[error("Peer aborted the association")]
	Aborted,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(0);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;

	#[test]
	fn status_type_ranges() {
		assert_eq!(StatusType::try_from(0x0000), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
		assert_eq!(
			StatusType::try_from(status::UNABLE_TO_PROCESS),
			Ok(StatusType::Failure)
		);
		assert_eq!(
			StatusType::try_from(status::MOVE_DESTINATION_UNKNOWN),
			Ok(StatusType::Failure)
		);
		assert_eq!(StatusType::try_from(0xFE00), Ok(StatusType::Cancel));
	}

	fn command_pdv(command: &InMemDicomObject, is_last: bool) -> PDataValue {
		let mut buf = Vec::new();
		command
			.write_dataset_with_ts(&mut buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
			.unwrap();
		PDataValue {
			value_type: PDataValueType::Command,
			presentation_context_id: 1,
			is_last,
			data: buf,
		}
	}

	fn echo_command() -> InMemDicomObject {
		InMemDicomObject::command_from_element_iter([
			DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [commands::C_ECHO_RQ]),
			),
			DataElement::new(
				tags::COMMAND_DATA_SET_TYPE,
				VR::US,
				dicom_value!(U16, [DATA_SET_MISSING]),
			),
		])
	}

	#[test]
	fn assembly_completes_on_final_command_fragment() {
		let mut assembly = MessageAssembly::default();
		let step = assembly.push(command_pdv(&echo_command(), true)).unwrap();
		assert!(matches!(step, AssemblyStep::CommandOnly(_, 1)));
	}

	#[test]
	fn assembly_rejects_data_before_command() {
		let mut assembly = MessageAssembly::default();
		let pdv = PDataValue {
			value_type: PDataValueType::Data,
			presentation_context_id: 1,
			is_last: true,
			data: vec![0u8; 8],
		};
		assert!(matches!(assembly.push(pdv), Err(ReadError::OutOfOrder)));
	}

	#[test]
	fn assembly_rejects_second_command_set() {
		let mut assembly = MessageAssembly::default();
		let announcing = InMemDicomObject::command_from_element_iter([
			DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [commands::C_FIND_RQ]),
			),
			DataElement::new(
				tags::COMMAND_DATA_SET_TYPE,
				VR::US,
				dicom_value!(U16, [DATA_SET_EXISTS]),
			),
		]);
		assert!(matches!(
			assembly.push(command_pdv(&announcing, true)),
			Ok(AssemblyStep::Incomplete)
		));
		assert!(matches!(
			assembly.push(command_pdv(&echo_command(), true)),
			Err(ReadError::OutOfOrder)
		));
	}

	#[test]
	fn message_status_parsing() {
		let message = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([DataElement::new(
				tags::STATUS,
				VR::US,
				dicom_value!(U16, [status::PENDING]),
			)]),
			data: None,
			presentation_context_id: None,
		};
		assert_eq!(message.status_type(), Some(StatusType::Pending));
	}
}
