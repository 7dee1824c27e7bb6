use tokio::sync::mpsc;

use super::{
    channel::{ChannelId, IoId},
    context::Context,
};
use crate::messages::{Access, describe_status};

/// Something the owner of a [`Context`] should hear about
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A channel gained or lost its server
    ConnectionChanged { channel: ChannelId, connected: bool },
    AccessRightsChanged { channel: ChannelId, access: Access },
    ReadCompleted {
        io: IoId,
        channel: ChannelId,
        data_type: u16,
        count: u32,
        data: Vec<u8>,
    },
    WriteCompleted { io: IoId, channel: ChannelId },
    SubscriptionUpdate {
        io: IoId,
        channel: ChannelId,
        data_type: u16,
        count: u32,
        data: Vec<u8>,
    },
    /// A request failed. Subscriptions stay installed after a failed update.
    IoFailed {
        io: IoId,
        channel: ChannelId,
        status: u32,
        context: String,
    },
    /// A problem with no outstanding request to attach it to
    Exception {
        channel: Option<ChannelId>,
        status: u32,
        context: String,
    },
}

impl Notification {
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Notification::ConnectionChanged { channel, .. }
            | Notification::AccessRightsChanged { channel, .. }
            | Notification::ReadCompleted { channel, .. }
            | Notification::WriteCompleted { channel, .. }
            | Notification::SubscriptionUpdate { channel, .. }
            | Notification::IoFailed { channel, .. } => Some(*channel),
            Notification::Exception { channel, .. } => *channel,
        }
    }

    /// Human readable status, for failures
    pub fn status_text(&self) -> Option<String> {
        match self {
            Notification::IoFailed { status, .. } | Notification::Exception { status, .. } => {
                Some(describe_status(*status))
            }
            _ => None,
        }
    }
}

/// Receives notifications.
///
/// Called with the engine state unlocked and the callback lock held, so
/// implementations may call straight back into the [`Context`], but are
/// never called concurrently with each other.
pub trait EventHandler: Send + Sync {
    fn notify(&self, context: &Context, notification: Notification);
}

impl EventHandler for mpsc::UnboundedSender<Notification> {
    fn notify(&self, _context: &Context, notification: Notification) {
        // Nobody listening is not our problem
        let _ = self.send(notification);
    }
}
