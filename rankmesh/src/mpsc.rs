//! Pluggable MPSC channel backends.
//!
//! The registry routes one unbounded MPSC channel into every endpoint. The
//! default backend wraps `std::sync::mpsc`; a `crossbeam-channel` backend is
//! available behind the `crossbeam` feature.

use std::sync::mpsc;

/// Error returned when sending fails because the receiver has disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> std::fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sending on a disconnected channel")
    }
}

impl<T: std::fmt::Debug> std::error::Error for SendError<T> {}

/// Error returned when a non-blocking receive finds no message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// The channel is empty.
    Empty,
    /// All senders have disconnected.
    Disconnected,
}

impl std::fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "receiving on an empty channel"),
            TryRecvError::Disconnected => write!(f, "receiving on a disconnected channel"),
        }
    }
}

impl std::error::Error for TryRecvError {}

/// The sending half of a channel.
pub trait MpscChannelSender<T: Send>: Clone + Send {
    /// Sends a value, failing if the receiver has disconnected.
    fn send(&self, value: T) -> Result<(), SendError<T>>;
}

/// The receiving half of a channel.
pub trait MpscChannelReceiver<T: Send>: Send {
    /// Receives a value without blocking.
    fn try_recv(&self) -> Result<T, TryRecvError>;
}

/// An MPSC channel implementation.
pub trait MpscChannel: 'static {
    type Sender<T: Send>: MpscChannelSender<T>;
    type Receiver<T: Send>: MpscChannelReceiver<T>;

    /// Creates a new unbounded channel.
    fn channel<T: Send>() -> (Self::Sender<T>, Self::Receiver<T>);
}

/// Backend using `std::sync::mpsc`.
pub struct StdMpsc;

pub struct StdMpscSender<T>(mpsc::Sender<T>);

impl<T> Clone for StdMpscSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send> MpscChannelSender<T> for StdMpscSender<T> {
    fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.0.send(value).map_err(|e| SendError(e.0))
    }
}

pub struct StdMpscReceiver<T>(mpsc::Receiver<T>);

impl<T: Send> MpscChannelReceiver<T> for StdMpscReceiver<T> {
    fn try_recv(&self) -> Result<T, TryRecvError> {
        self.0.try_recv().map_err(|e| match e {
            mpsc::TryRecvError::Empty => TryRecvError::Empty,
            mpsc::TryRecvError::Disconnected => TryRecvError::Disconnected,
        })
    }
}

impl MpscChannel for StdMpsc {
    type Sender<T: Send> = StdMpscSender<T>;
    type Receiver<T: Send> = StdMpscReceiver<T>;

    fn channel<T: Send>() -> (Self::Sender<T>, Self::Receiver<T>) {
        let (tx, rx) = mpsc::channel();
        (StdMpscSender(tx), StdMpscReceiver(rx))
    }
}

/// Backend using `crossbeam-channel`.
#[cfg(feature = "crossbeam")]
pub struct CrossbeamMpsc;

#[cfg(feature = "crossbeam")]
pub struct CrossbeamSender<T>(crossbeam_channel::Sender<T>);

#[cfg(feature = "crossbeam")]
impl<T> Clone for CrossbeamSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(feature = "crossbeam")]
impl<T: Send> MpscChannelSender<T> for CrossbeamSender<T> {
    fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.0.send(value).map_err(|e| SendError(e.0))
    }
}

#[cfg(feature = "crossbeam")]
pub struct CrossbeamReceiver<T>(crossbeam_channel::Receiver<T>);

#[cfg(feature = "crossbeam")]
impl<T: Send> MpscChannelReceiver<T> for CrossbeamReceiver<T> {
    fn try_recv(&self) -> Result<T, TryRecvError> {
        self.0.try_recv().map_err(|e| match e {
            crossbeam_channel::TryRecvError::Empty => TryRecvError::Empty,
            crossbeam_channel::TryRecvError::Disconnected => TryRecvError::Disconnected,
        })
    }
}

#[cfg(feature = "crossbeam")]
impl MpscChannel for CrossbeamMpsc {
    type Sender<T: Send> = CrossbeamSender<T>;
    type Receiver<T: Send> = CrossbeamReceiver<T>;

    fn channel<T: Send>() -> (Self::Sender<T>, Self::Receiver<T>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (CrossbeamSender(tx), CrossbeamReceiver(rx))
    }
}
