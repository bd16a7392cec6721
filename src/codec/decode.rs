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

use bitcoin::consensus::encode::Error;
use bitcoin::consensus::Decodable;

use crate::denoms::Denom;
use crate::messages::{
    Complete, Entry, FinalTx, JoinRequest, QueueOffer, SignedInputs, StatusUpdate,
};

impl Decodable for QueueOffer {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(QueueOffer {
            denom: Denom::from_bits(u32::consensus_decode(reader)?),
            node_collateral: Decodable::consensus_decode(reader)?,
            node_id: Decodable::consensus_decode(reader)?,
            timestamp: Decodable::consensus_decode(reader)?,
            ready: Decodable::consensus_decode(reader)?,
            signature: Decodable::consensus_decode(reader)?,
            tried: false,
        })
    }
}

impl Decodable for JoinRequest {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(JoinRequest {
            denom: Denom::from_bits(u32::consensus_decode(reader)?),
            collateral_tx: Decodable::consensus_decode(reader)?,
        })
    }
}

impl Decodable for Entry {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(Entry {
            inputs: Decodable::consensus_decode(reader)?,
            outputs: Decodable::consensus_decode(reader)?,
            collateral: Decodable::consensus_decode(reader)?,
        })
    }
}

impl Decodable for StatusUpdate {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(StatusUpdate {
            session_id: Decodable::consensus_decode(reader)?,
            state: Decodable::consensus_decode(reader)?,
            status: Decodable::consensus_decode(reader)?,
            message_id: Decodable::consensus_decode(reader)?,
        })
    }
}

impl Decodable for FinalTx {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(FinalTx {
            session_id: Decodable::consensus_decode(reader)?,
            tx: Decodable::consensus_decode(reader)?,
        })
    }
}

impl Decodable for SignedInputs {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(SignedInputs { inputs: Decodable::consensus_decode(reader)? })
    }
}

impl Decodable for Complete {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(Complete {
            session_id: Decodable::consensus_decode(reader)?,
            message_id: Decodable::consensus_decode(reader)?,
        })
    }
}
