// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use super::params::PROTOCOL_VERSION_V2;

/// The fee table of one block. Produced per block version so repricing forks
/// never change the cost of already-sealed history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    /// Base charge of entering a call frame.
    pub call_gas: u64,
    /// Base charge of a contract deploy.
    pub create_gas: u64,
    /// Charge per byte of deployed code.
    pub create_data_gas: u64,

    // Table operation costs, charged through the precompiled gas pricer.
    pub open_table_gas: u64,
    pub create_table_gas: u64,
    pub select_gas: u64,
    pub insert_gas: u64,
    pub update_gas: u64,
    pub remove_gas: u64,
    /// Charge per 32-byte word of precompiled working memory.
    pub memory_word_gas: u64,
}

impl Schedule {
    pub fn new(version: u32) -> Self {
        let mut schedule = Schedule {
            call_gas: 700,
            create_gas: 32_000,
            create_data_gas: 200,
            open_table_gas: 200,
            create_table_gas: 16_000,
            select_gas: 800,
            insert_gas: 10_000,
            update_gas: 5_000,
            remove_gas: 2_500,
            memory_word_gas: 3,
        };
        if version >= PROTOCOL_VERSION_V2 {
            // V2 repriced storage reads after the key-page rework.
            schedule.select_gas = 1_000;
            schedule.open_table_gas = 500;
        }
        schedule
    }
}
