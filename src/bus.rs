use usb_device::Result;

use crate::descriptor::EndpointInfo;
use crate::request::SetupPacket;

/// Handle to a pipe opened through [`HostBus::open_pipe`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PipeId(pub u8);

/// Outcome of one poll of a control request.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RequestStatus {
    /// Completed, with the number of bytes moved in the data stage.
    Ok(usize),
    /// Submitted or still in flight, poll again.
    Busy,
    /// The device stalled the request.
    NotSupported,
    Error,
}

/// Status of the transfer last submitted on a pipe.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransferStatus {
    Done,
    Busy,
    /// The controller could not schedule the transfer, it must be submitted again.
    NotReady,
    Error,
    Stall,
}

/// The USB host controller as seen by the CDC-ECM driver.
///
/// Nothing here may block. Control requests are polled: the driver calls
/// [`control_request`](Self::control_request) with the same setup packet on
/// every tick until it stops returning [`RequestStatus::Busy`]. Pipe transfers
/// are submitted once and then polled with
/// [`transfer_status`](Self::transfer_status).
pub trait HostBus {
    /// Runs `setup` on the default control pipe. For OUT requests `data` holds
    /// the data stage. For IN requests the data stage is copied into `data`
    /// once the request completes.
    fn control_request(&mut self, setup: &SetupPacket, data: &mut [u8]) -> RequestStatus;

    /// Allocates a pipe for `endpoint` of the attached device.
    fn open_pipe(&mut self, endpoint: &EndpointInfo) -> Result<PipeId>;

    fn close_pipe(&mut self, pipe: PipeId);

    fn submit_bulk_out(&mut self, pipe: PipeId, data: &[u8]);

    fn submit_bulk_in(&mut self, pipe: PipeId, length: u16);

    fn submit_interrupt_in(&mut self, pipe: PipeId, length: u16);

    fn transfer_status(&mut self, pipe: PipeId) -> TransferStatus;

    /// Byte count of the last completed transfer on `pipe`.
    fn last_transfer_size(&self, pipe: PipeId) -> usize;

    /// Copies the data of the last completed IN transfer into `buf` and
    /// returns how many bytes were copied.
    fn read_received(&mut self, pipe: PipeId, buf: &mut [u8]) -> usize;
}
