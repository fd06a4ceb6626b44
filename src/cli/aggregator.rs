// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Serve one calibration group over TCP.

use std::net::TcpListener;

use clap::Parser;
use itertools::Itertools;
use log::{debug, info};

use super::SelfcalError;
use crate::coordinator::{Aggregator, LinkError, TcpMemberEndpoint};

#[derive(Parser, Debug)]
pub(super) struct AggregatorArgs {
    /// The address to listen on, e.g. 127.0.0.1:7700.
    #[clap(short, long)]
    listen: String,

    /// The number of kernels in the calibration group. The aggregator waits
    /// for this many kernels to connect.
    #[clap(short, long)]
    group_size: usize,
}

impl AggregatorArgs {
    pub(super) fn run(self) -> Result<(), SelfcalError> {
        if self.group_size == 0 {
            return Err(SelfcalError::Generic(
                "The calibration group size must be at least 1".to_string(),
            ));
        }
        let listener = TcpListener::bind(&self.listen).map_err(LinkError::from)?;
        info!(
            "Listening on {} for {} kernels",
            listener.local_addr().map_err(LinkError::from)?,
            self.group_size
        );

        let mut endpoints = Vec::with_capacity(self.group_size);
        while endpoints.len() < self.group_size {
            let (stream, addr) = listener.accept().map_err(LinkError::from)?;
            debug!("Kernel connected from {addr}");
            endpoints.push(TcpMemberEndpoint::new(stream)?);
        }

        let mut aggregator = Aggregator::new(self.group_size);
        let stats = aggregator.serve(&mut endpoints)?;
        info!(
            "Served {} rounds over {} chunks for processes {}",
            stats.rounds,
            stats.chunks,
            stats.members.iter().join(", ")
        );
        Ok(())
    }
}
