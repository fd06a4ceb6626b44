// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Connections between calibration-group members and the aggregator.

use std::{
    io::{BufReader, BufWriter},
    net::TcpStream,
    thread,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};

use super::{
    wire::{read_message, write_message, Identify, Message, PartialEquations, Update},
    LinkError,
};
use crate::constants::{DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_BACKOFF_MS};

/// A member's connection to the aggregator of its calibration group.
pub trait AggregatorLink: Send {
    /// Establish the connection.
    fn connect(&mut self) -> Result<(), LinkError>;

    /// Tell the aggregator who we are; done once, right after connecting.
    fn identify(&mut self, process_id: u32, member: usize) -> Result<(), LinkError>;

    fn send_partial_equations(&mut self, equations: PartialEquations) -> Result<(), LinkError>;

    /// Wait for the aggregator's answer to the last equations sent.
    fn receive_update(&mut self) -> Result<Update, LinkError>;

    /// Tell the aggregator we're done and drop the connection.
    fn close(&mut self) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;
}

/// The aggregator's end of a connection to one member.
pub trait MemberEndpoint: Send {
    fn recv(&mut self) -> Result<Message, LinkError>;

    fn send(&mut self, message: &Message) -> Result<(), LinkError>;
}

fn expect_update(message: Message) -> Result<Update, LinkError> {
    match message {
        Message::Update(update) => Ok(update),
        other => Err(LinkError::Unexpected {
            expected: "update",
            got: other.name().to_string(),
        }),
    }
}

struct TcpConnection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Result<TcpConnection, LinkError> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(TcpConnection {
            reader,
            writer: BufWriter::new(stream),
        })
    }
}

/// Talks to a remote aggregator over TCP.
pub struct TcpAggregatorLink {
    addr: String,
    attempts: u32,
    backoff: Duration,
    conn: Option<TcpConnection>,
}

impl TcpAggregatorLink {
    pub fn new(addr: String) -> TcpAggregatorLink {
        TcpAggregatorLink {
            addr,
            attempts: DEFAULT_CONNECT_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_CONNECT_BACKOFF_MS),
            conn: None,
        }
    }

    /// Try to connect `attempts` times (at least once), waiting `backoff`
    /// after the first failure and doubling the wait after each one after
    /// that.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> TcpAggregatorLink {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    fn conn(&mut self) -> Result<&mut TcpConnection, LinkError> {
        self.conn.as_mut().ok_or(LinkError::NotConnected)
    }
}

impl AggregatorLink for TcpAggregatorLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        let mut backoff = self.backoff;
        let mut attempt = 1;
        loop {
            match TcpStream::connect(&self.addr) {
                Ok(stream) => {
                    debug!("Connected to the aggregator at {}", self.addr);
                    self.conn = Some(TcpConnection::new(stream)?);
                    return Ok(());
                }
                Err(source) if attempt >= self.attempts => {
                    return Err(LinkError::Connect {
                        addr: self.addr.clone(),
                        attempts: attempt,
                        source,
                    })
                }
                Err(e) => {
                    warn!(
                        "Couldn't connect to the aggregator at {} ({e}); retrying in {} ms",
                        self.addr,
                        backoff.as_millis()
                    );
                    thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }

    fn identify(&mut self, process_id: u32, member: usize) -> Result<(), LinkError> {
        let message = Message::Identify(Identify {
            process_id,
            member: member as u32,
        });
        write_message(&mut self.conn()?.writer, &message)
    }

    fn send_partial_equations(&mut self, equations: PartialEquations) -> Result<(), LinkError> {
        trace!("Sending equations for {} cells", equations.cells.len());
        write_message(&mut self.conn()?.writer, &Message::Equations(equations))
    }

    fn receive_update(&mut self) -> Result<Update, LinkError> {
        expect_update(read_message(&mut self.conn()?.reader)?)
    }

    fn close(&mut self) -> Result<(), LinkError> {
        if let Some(mut conn) = self.conn.take() {
            write_message(&mut conn.writer, &Message::Done)?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

/// The aggregator's end of a TCP connection.
pub struct TcpMemberEndpoint {
    conn: TcpConnection,
}

impl TcpMemberEndpoint {
    pub fn new(stream: TcpStream) -> Result<TcpMemberEndpoint, LinkError> {
        Ok(TcpMemberEndpoint {
            conn: TcpConnection::new(stream)?,
        })
    }
}

impl MemberEndpoint for TcpMemberEndpoint {
    fn recv(&mut self) -> Result<Message, LinkError> {
        read_message(&mut self.conn.reader)
    }

    fn send(&mut self, message: &Message) -> Result<(), LinkError> {
        write_message(&mut self.conn.writer, message)
    }
}

/// Talks to an aggregator running in the same process.
pub struct ChannelAggregatorLink {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    connected: bool,
}

/// The aggregator's end of an in-process link.
pub struct ChannelMemberEndpoint {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// Make both ends of an in-process link.
pub fn channel_link() -> (ChannelAggregatorLink, ChannelMemberEndpoint) {
    let (to_aggregator, from_member) = unbounded();
    let (to_member, from_aggregator) = unbounded();
    (
        ChannelAggregatorLink {
            tx: to_aggregator,
            rx: from_aggregator,
            connected: false,
        },
        ChannelMemberEndpoint {
            tx: to_member,
            rx: from_member,
        },
    )
}

impl ChannelAggregatorLink {
    fn send(&self, message: Message) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.tx.send(message).map_err(|_| LinkError::Closed)
    }
}

impl AggregatorLink for ChannelAggregatorLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        self.connected = true;
        Ok(())
    }

    fn identify(&mut self, process_id: u32, member: usize) -> Result<(), LinkError> {
        self.send(Message::Identify(Identify {
            process_id,
            member: member as u32,
        }))
    }

    fn send_partial_equations(&mut self, equations: PartialEquations) -> Result<(), LinkError> {
        self.send(Message::Equations(equations))
    }

    fn receive_update(&mut self) -> Result<Update, LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        expect_update(self.rx.recv().map_err(|_| LinkError::Closed)?)
    }

    fn close(&mut self) -> Result<(), LinkError> {
        if self.connected {
            self.send(Message::Done)?;
            self.connected = false;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl MemberEndpoint for ChannelMemberEndpoint {
    fn recv(&mut self) -> Result<Message, LinkError> {
        self.rx.recv().map_err(|_| LinkError::Closed)
    }

    fn send(&mut self, message: &Message) -> Result<(), LinkError> {
        self.tx.send(message.clone()).map_err(|_| LinkError::Closed)
    }
}
