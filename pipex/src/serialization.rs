// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use crate::ppp::mppe::MPPE_KEY_LEN;
use zeroize::Zeroize;

/// A MPPE master key as written on the control socket. Wiped on drop.
#[derive(Debug)]
pub struct KeyBytes(pub [u8; MPPE_KEY_LEN]);

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::str::FromStr for KeyBytes {
    type Err = &'static str;

    // From Hex or base64 to KeyBytes ~ [u8; 16]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut internal = [0u8; MPPE_KEY_LEN];

        match s.len() {
            32 => {
                hex::decode_to_slice(s, &mut internal).map_err(|_| "Error: Illegal character in key")?;
            }
            22 | 24 => {
                let mut decoded_key = base64::decode(s).map_err(|_| "Error: Illegal character in key")?;
                if decoded_key.len() != internal.len() {
                    decoded_key.zeroize();
                    return Err("Error: Illegal key size");
                }
                internal.copy_from_slice(&decoded_key);
                decoded_key.zeroize();
            }
            _ => return Err("Error: Illegal key size"),
        }

        Ok(KeyBytes(internal))
    }
}
