// vortex-client-rs
// Copyright (C) 2023  Straylight <straylight_orbit@protonmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Byte-level forms of the protocol messages. Message payloads use the
//! consensus encoding of the underlying bitcoin types; the peer-to-peer
//! framing around `(tag, payload)` is supplied by the transport.

mod decode;
mod encode;

use bitcoin::consensus::{deserialize, serialize};

use crate::messages::{ClientMessage, ServerMessage};

#[derive(Debug)]
pub enum Error {
    Bitcoin(bitcoin::consensus::encode::Error),
    UnknownMessage(String),
}

impl From<bitcoin::consensus::encode::Error> for Error {
    fn from(error: bitcoin::consensus::encode::Error) -> Self {
        Error::Bitcoin(error)
    }
}

/// Encodes a client message into its wire tag and payload.
pub fn encode_client(msg: &ClientMessage) -> (&'static str, Vec<u8>) {
    let payload = match msg {
        ClientMessage::Join(join) => serialize(join),
        ClientMessage::Entry(entry) => serialize(entry),
        ClientMessage::Signatures(sigs) => serialize(sigs),
    };
    (msg.tag(), payload)
}

/// Encodes a server message into its wire tag and payload. Used by tests
/// and by transports that relay queue offers.
pub fn encode_server(msg: &ServerMessage) -> (&'static str, Vec<u8>) {
    let payload = match msg {
        ServerMessage::Offer(offer) => serialize(offer),
        ServerMessage::Status(status) => serialize(status),
        ServerMessage::FinalTx(final_tx) => serialize(final_tx),
        ServerMessage::Complete(complete) => serialize(complete),
    };
    (msg.tag(), payload)
}

/// Decodes a server message from its wire tag and payload. Trailing bytes
/// are rejected.
pub fn decode_server(tag: &str, payload: &[u8]) -> Result<ServerMessage, Error> {
    match tag {
        "dsq" => Ok(ServerMessage::Offer(deserialize(payload)?)),
        "dssu" => Ok(ServerMessage::Status(deserialize(payload)?)),
        "dsf" => Ok(ServerMessage::FinalTx(deserialize(payload)?)),
        "dsc" => Ok(ServerMessage::Complete(deserialize(payload)?)),
        other => Err(Error::UnknownMessage(other.to_owned())),
    }
}

/// Decodes a client message from its wire tag and payload.
pub fn decode_client(tag: &str, payload: &[u8]) -> Result<ClientMessage, Error> {
    match tag {
        "dsa" => Ok(ClientMessage::Join(deserialize(payload)?)),
        "dsi" => Ok(ClientMessage::Entry(deserialize(payload)?)),
        "dss" => Ok(ClientMessage::Signatures(deserialize(payload)?)),
        other => Err(Error::UnknownMessage(other.to_owned())),
    }
}
