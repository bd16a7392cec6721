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

use std::io;

use bitcoin::consensus::Encodable;

use crate::messages::{
    Complete, Entry, FinalTx, JoinRequest, QueueOffer, SignedInputs, StatusUpdate,
};

impl Encodable for QueueOffer {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        // `tried` is local bookkeeping and never leaves the process
        let mut len = self.denom.to_bits().consensus_encode(writer)?;
        len += self.node_collateral.consensus_encode(writer)?;
        len += self.node_id.consensus_encode(writer)?;
        len += self.timestamp.consensus_encode(writer)?;
        len += self.ready.consensus_encode(writer)?;
        len += self.signature.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Encodable for JoinRequest {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.denom.to_bits().consensus_encode(writer)?;
        len += self.collateral_tx.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Encodable for Entry {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.inputs.consensus_encode(writer)?;
        len += self.outputs.consensus_encode(writer)?;
        len += self.collateral.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Encodable for StatusUpdate {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.session_id.consensus_encode(writer)?;
        len += self.state.consensus_encode(writer)?;
        len += self.status.consensus_encode(writer)?;
        len += self.message_id.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Encodable for FinalTx {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.session_id.consensus_encode(writer)?;
        len += self.tx.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Encodable for SignedInputs {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.inputs.consensus_encode(writer)
    }
}

impl Encodable for Complete {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.session_id.consensus_encode(writer)?;
        len += self.message_id.consensus_encode(writer)?;
        Ok(len)
    }
}
