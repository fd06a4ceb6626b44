// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The messages exchanged between calibration-group members and the
//! aggregator, and their byte encoding.
//!
//! Every message is a frame: a little-endian `u32` payload length, then the
//! payload. The payload starts with a one-byte tag. All integers and floats
//! are little endian. Cell locations are two `u32`s (frequency, then time).

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::LinkError;
use crate::{
    grid::Location,
    solver::{NormalEquations, SolverOptions, SolverStatus},
};

const MAGIC: &[u8; 4] = b"SCAL";
const VERSION: u32 = 1;
/// Frames bigger than this are refused.
const MAX_FRAME_LEN: u32 = 1 << 30;

const TAG_IDENTIFY: u8 = 1;
const TAG_EQUATIONS: u8 = 2;
const TAG_UPDATE: u8 = 3;
const TAG_DONE: u8 = 4;

/// The handshake a member sends after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identify {
    pub process_id: u32,
    /// The member's position in its calibration group.
    pub member: u32,
}

/// The condition equations a member gathered for one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellEquations {
    pub location: Location,
    /// The member's current coefficients; the aggregator starts new cells
    /// from the first ones it sees.
    pub coeff: Vec<f64>,
    pub equations: NormalEquations,
}

/// One member's contribution to a solve round.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialEquations {
    pub options: SolverOptions,
    /// The length of the robust epsilon schedule, 1 for the standard
    /// variant.
    pub schedule_len: u32,
    pub cells: Vec<CellEquations>,
}

/// The solved state of one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellUpdate {
    pub location: Location,
    pub coeff: Vec<f64>,
    pub status: SolverStatus,
    pub epsilon_index: u32,
}

/// The aggregator's reply to a solve round.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub cells: Vec<CellUpdate>,
    /// Every cell of the chunk has a terminal status.
    pub chunk_done: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Identify(Identify),
    Equations(PartialEquations),
    Update(Update),
    /// The member has nothing more to solve.
    Done,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Identify(_) => "identify",
            Message::Equations(_) => "equations",
            Message::Update(_) => "update",
            Message::Done => "done",
        }
    }
}

/// Write `message` as one frame.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), LinkError> {
    let payload = encode(message)?;
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. A connection closed before the frame starts is
/// [`LinkError::Closed`].
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, LinkError> {
    let len = match reader.read_u32::<LittleEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(LinkError::Closed),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(LinkError::FrameTooLarge(len));
    }
    let mut payload = vec![0; len as usize];
    reader.read_exact(&mut payload)?;
    decode(&payload)
}

pub fn encode(message: &Message) -> Result<Vec<u8>, LinkError> {
    let mut buf = vec![];
    match message {
        Message::Identify(identify) => {
            buf.write_u8(TAG_IDENTIFY)?;
            buf.write_all(MAGIC)?;
            buf.write_u32::<LittleEndian>(VERSION)?;
            buf.write_u32::<LittleEndian>(identify.process_id)?;
            buf.write_u32::<LittleEndian>(identify.member)?;
        }

        Message::Equations(partial) => {
            buf.write_u8(TAG_EQUATIONS)?;
            let o = &partial.options;
            buf.write_u32::<LittleEndian>(o.max_iterations)?;
            buf.write_f64::<LittleEndian>(o.epsilon_value)?;
            buf.write_f64::<LittleEndian>(o.epsilon_derivative)?;
            buf.write_f64::<LittleEndian>(o.lm_factor)?;
            buf.write_u8(o.use_svd as u8)?;
            buf.write_u32::<LittleEndian>(partial.schedule_len)?;
            buf.write_u32::<LittleEndian>(partial.cells.len() as u32)?;
            for cell in &partial.cells {
                write_location(&mut buf, cell.location)?;
                write_f64s(&mut buf, &cell.coeff)?;
                let eq = &cell.equations;
                buf.write_u32::<LittleEndian>(eq.num_unknowns() as u32)?;
                buf.write_f64::<LittleEndian>(eq.chi2())?;
                buf.write_u64::<LittleEndian>(eq.count())?;
                for v in eq.matrix().iter().chain(eq.rhs().iter()) {
                    buf.write_f64::<LittleEndian>(*v)?;
                }
            }
        }

        Message::Update(update) => {
            buf.write_u8(TAG_UPDATE)?;
            buf.write_u8(update.chunk_done as u8)?;
            buf.write_u32::<LittleEndian>(update.cells.len() as u32)?;
            for cell in &update.cells {
                write_location(&mut buf, cell.location)?;
                buf.write_u8(cell.status.to_u8())?;
                buf.write_u32::<LittleEndian>(cell.epsilon_index)?;
                write_f64s(&mut buf, &cell.coeff)?;
            }
        }

        Message::Done => buf.write_u8(TAG_DONE)?,
    }
    Ok(buf)
}

pub fn decode(payload: &[u8]) -> Result<Message, LinkError> {
    let mut cur = Cursor::new(payload);
    let message = match cur.read_u8()? {
        TAG_IDENTIFY => {
            let mut magic = [0; 4];
            cur.read_exact(&mut magic)?;
            if &magic != MAGIC {
                return Err(LinkError::Malformed(format!(
                    "bad magic bytes {magic:?} in handshake"
                )));
            }
            let version = cur.read_u32::<LittleEndian>()?;
            if version != VERSION {
                return Err(LinkError::Malformed(format!(
                    "protocol version {version} isn't supported (expected {VERSION})"
                )));
            }
            Message::Identify(Identify {
                process_id: cur.read_u32::<LittleEndian>()?,
                member: cur.read_u32::<LittleEndian>()?,
            })
        }

        TAG_EQUATIONS => {
            let options = SolverOptions {
                max_iterations: cur.read_u32::<LittleEndian>()?,
                epsilon_value: cur.read_f64::<LittleEndian>()?,
                epsilon_derivative: cur.read_f64::<LittleEndian>()?,
                lm_factor: cur.read_f64::<LittleEndian>()?,
                use_svd: cur.read_u8()? != 0,
            };
            let schedule_len = cur.read_u32::<LittleEndian>()?;
            let num_cells = cur.read_u32::<LittleEndian>()? as usize;
            let mut cells = Vec::with_capacity(num_cells.min(payload.len()));
            for _ in 0..num_cells {
                let location = read_location(&mut cur)?;
                let coeff = read_f64s(&mut cur, payload.len())?;
                let n = cur.read_u32::<LittleEndian>()? as usize;
                let chi2 = cur.read_f64::<LittleEndian>()?;
                let count = cur.read_u64::<LittleEndian>()?;
                let needed = n
                    .checked_mul(n)
                    .and_then(|nn| nn.checked_add(n))
                    .and_then(|values| values.checked_mul(8))
                    .ok_or_else(|| {
                        LinkError::Malformed(format!("{n} unknowns for cell {location} is too many"))
                    })?;
                check_remaining(&cur, payload.len(), needed)?;
                let mut matrix = vec![0.0; n * n];
                cur.read_f64_into::<LittleEndian>(&mut matrix)?;
                let mut rhs = vec![0.0; n];
                cur.read_f64_into::<LittleEndian>(&mut rhs)?;
                let equations = NormalEquations::from_parts(n, matrix, rhs, chi2, count)
                    .ok_or_else(|| {
                        LinkError::Malformed(format!("inconsistent equations for cell {location}"))
                    })?;
                cells.push(CellEquations {
                    location,
                    coeff,
                    equations,
                });
            }
            Message::Equations(PartialEquations {
                options,
                schedule_len,
                cells,
            })
        }

        TAG_UPDATE => {
            let chunk_done = cur.read_u8()? != 0;
            let num_cells = cur.read_u32::<LittleEndian>()? as usize;
            let mut cells = Vec::with_capacity(num_cells.min(payload.len()));
            for _ in 0..num_cells {
                let location = read_location(&mut cur)?;
                let code = cur.read_u8()?;
                let status = SolverStatus::from_u8(code).ok_or_else(|| {
                    LinkError::Malformed(format!("unknown solver status code {code}"))
                })?;
                let epsilon_index = cur.read_u32::<LittleEndian>()?;
                let coeff = read_f64s(&mut cur, payload.len())?;
                cells.push(CellUpdate {
                    location,
                    coeff,
                    status,
                    epsilon_index,
                });
            }
            Message::Update(Update { cells, chunk_done })
        }

        TAG_DONE => Message::Done,

        tag => return Err(LinkError::Malformed(format!("unknown message tag {tag}"))),
    };

    if (cur.position() as usize) != payload.len() {
        return Err(LinkError::Malformed(format!(
            "{} trailing bytes after a {} message",
            payload.len() - cur.position() as usize,
            message.name()
        )));
    }
    Ok(message)
}

fn write_location(buf: &mut Vec<u8>, location: Location) -> std::io::Result<()> {
    buf.write_u32::<LittleEndian>(location.freq as u32)?;
    buf.write_u32::<LittleEndian>(location.time as u32)
}

fn read_location(cur: &mut Cursor<&[u8]>) -> std::io::Result<Location> {
    let freq = cur.read_u32::<LittleEndian>()? as usize;
    let time = cur.read_u32::<LittleEndian>()? as usize;
    Ok(Location::new(freq, time))
}

fn write_f64s(buf: &mut Vec<u8>, values: &[f64]) -> std::io::Result<()> {
    buf.write_u32::<LittleEndian>(values.len() as u32)?;
    for v in values {
        buf.write_f64::<LittleEndian>(*v)?;
    }
    Ok(())
}

fn read_f64s(cur: &mut Cursor<&[u8]>, total: usize) -> Result<Vec<f64>, LinkError> {
    let n = cur.read_u32::<LittleEndian>()? as usize;
    let needed = n
        .checked_mul(8)
        .ok_or_else(|| LinkError::Malformed(format!("{n} values is too many")))?;
    check_remaining(cur, total, needed)?;
    let mut values = vec![0.0; n];
    cur.read_f64_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

/// Don't allocate for lengths the payload can't hold.
fn check_remaining(cur: &Cursor<&[u8]>, total: usize, needed: usize) -> Result<(), LinkError> {
    let remaining = total.saturating_sub(cur.position() as usize);
    if needed > remaining {
        Err(LinkError::Malformed(format!(
            "need {needed} more bytes but only {remaining} remain"
        )))
    } else {
        Ok(())
    }
}
