//! Point-to-point connector contract. One transporter is selected per
//! connection at setup time and dispatched through `&'static dyn` from
//! then on; per-connection state travels as opaque `TransportResources`.

use std::any::Any;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::channel::PeerConnId;
use crate::comm::{profile::CommProfile, PeerInfo};

pub type TransportResources = Box<dyn Any + Send>;
pub type TransporterError = anyhow::Error;

pub const CONNECT_HANDLE_SIZE: usize = 128;

/// Fixed-size opaque connect handle exchanged over the bootstrap channel.
/// Fixed size keeps the exchange rounds trivially framed.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct ConnectHandle(pub [u8; CONNECT_HANDLE_SIZE]);

#[derive(Debug, Error)]
pub enum ConnectHandleError {
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Required size {0} exceeds maximum of {}", CONNECT_HANDLE_SIZE)]
    ExceedMaxSize(usize),
}

impl ConnectHandle {
    pub fn serialize_from<T: Serialize>(handle: T) -> Result<Self, ConnectHandleError> {
        let mut serialized = [0u8; CONNECT_HANDLE_SIZE];
        let required_size = bincode::serialized_size(&handle)?;
        if required_size as usize > CONNECT_HANDLE_SIZE {
            return Err(ConnectHandleError::ExceedMaxSize(required_size as usize));
        }
        bincode::serialize_into(serialized.as_mut_slice(), &handle)?;
        Ok(ConnectHandle(serialized))
    }

    pub fn deserialize_to<T: DeserializeOwned>(&self) -> Result<T, ConnectHandleError> {
        let handle = bincode::deserialize::<T>(self.0.as_slice())?;
        Ok(handle)
    }
}

pub struct TransportSetup {
    /// Handle to hand to the peer during the exchange rounds.
    pub peer_connect_handle: ConnectHandle,
    pub setup_resources: Option<TransportResources>,
}

pub struct TransportConnect {
    pub transport_resources: TransportResources,
}

pub trait Transporter: Send + Sync {
    fn name(&self) -> &'static str;

    // Determine whether two peers can communicate
    fn can_connect(&self, send_peer: &PeerInfo, recv_peer: &PeerInfo, profile: &CommProfile)
        -> bool;

    // Setup sender transport, prepare any sender-side resources
    fn send_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        profile: &CommProfile,
    ) -> Result<TransportSetup, TransporterError>;

    // Connect sender transport to receiver, given the receiver's handle
    fn send_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<TransportResources>,
    ) -> Result<TransportConnect, TransporterError>;

    // Setup receiver transport
    fn recv_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        profile: &CommProfile,
    ) -> Result<TransportSetup, TransporterError>;

    // Connect receiver transport
    fn recv_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<TransportResources>,
    ) -> Result<TransportConnect, TransporterError>;

    // Release per-connection state; must be safe to call on either side.
    fn free(&self, resources: TransportResources) -> Result<(), TransporterError>;
}
