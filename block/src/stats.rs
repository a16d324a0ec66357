// Copyright © 2024 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockAcctType {
    Read = 0,
    Write = 1,
    Flush = 2,
}

const BLOCK_MAX_IOTYPE: usize = 3;

/// I/O accounting of one block handle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockAcctStats {
    nr_bytes: [u64; BLOCK_MAX_IOTYPE],
    nr_ops: [u64; BLOCK_MAX_IOTYPE],
    total_time_ns: [u64; BLOCK_MAX_IOTYPE],
    pub wr_highest_sector: u64,
}

impl BlockAcctStats {
    pub(crate) fn account(&mut self, kind: BlockAcctType, bytes: u64, time_ns: u64) {
        let i = kind as usize;
        self.nr_bytes[i] += bytes;
        self.nr_ops[i] += 1;
        self.total_time_ns[i] += time_ns;
    }

    pub fn nr_bytes(&self, kind: BlockAcctType) -> u64 {
        self.nr_bytes[kind as usize]
    }

    pub fn nr_ops(&self, kind: BlockAcctType) -> u64 {
        self.nr_ops[kind as usize]
    }

    pub fn total_time_ns(&self, kind: BlockAcctType) -> u64 {
        self.total_time_ns[kind as usize]
    }
}

/// Consumer policy on I/O errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockdevOnError {
    #[default]
    Report,
    Ignore,
    /// Stop on `ENOSPC`, report anything else.
    Enospc,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockErrorAction {
    Report,
    Ignore,
    Stop,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IoStatus {
    #[default]
    Ok,
    Failed,
    NoSpace,
}

impl BlockdevOnError {
    /// Action to take on a request that failed with the negative `errno`.
    pub fn action(self, errno: i32) -> BlockErrorAction {
        match self {
            BlockdevOnError::Report => BlockErrorAction::Report,
            BlockdevOnError::Ignore => BlockErrorAction::Ignore,
            BlockdevOnError::Stop => BlockErrorAction::Stop,
            BlockdevOnError::Enospc if errno == -libc::ENOSPC => BlockErrorAction::Stop,
            BlockdevOnError::Enospc => BlockErrorAction::Report,
        }
    }
}
