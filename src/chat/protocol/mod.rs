//! Chat protocol types.
//!
//! One tagged variant per wire message, split by direction. See
//! [`message`] for the envelope format.

mod message;

pub use message::{
    from_bytes, to_bytes, ClientMessage, Delivery, Echo, Empty, FileDelivery, FileUpload, Login,
    OtpChallenge, OtpResponse, PrivatePost, PublicKeyAnnouncement, PublicPost, Roster,
    ServerMessage, SessionKeyDelivery,
};
