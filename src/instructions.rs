//! Helpers building QuMIS trigger instructions.
//!
//! A trigger codeword is a 7-character binary string; character `i`
//! (counting from the left, starting at 1) drives marker channel `i`.

use crate::error::{AppResult, McError};

/// Number of marker channels in a codeword.
pub const CODEWORD_WIDTH: usize = 7;

/// Binary representation of `x` in `width` characters.
///
/// With `lsb_last == false` the string is reversed so the least
/// significant bit comes first.
pub fn int_to_bin(x: u64, width: usize, lsb_last: bool) -> AppResult<String> {
    if width < 64 && x >> width != 0 {
        return Err(McError::Instruction(format!(
            "{} does not fit in {} bits",
            x, width
        )));
    }
    let bits = format!("{:0width$b}", x, width = width);
    if lsb_last {
        Ok(bits)
    } else {
        Ok(bits.chars().rev().collect())
    }
}

fn check_channel(channel: u8) -> AppResult<()> {
    if !(1..=CODEWORD_WIDTH as u8).contains(&channel) {
        return Err(McError::Instruction(format!(
            "channel must be between 1 and {}, got {}",
            CODEWORD_WIDTH, channel
        )));
    }
    Ok(())
}

/// Codeword with only `channel` set.
pub fn trigger_codeword(channel: u8) -> AppResult<String> {
    check_channel(channel)?;
    let mut cw = vec!['0'; CODEWORD_WIDTH];
    cw[usize::from(channel) - 1] = '1';
    Ok(cw.into_iter().collect())
}

fn parse_codeword(cw: &str) -> AppResult<u32> {
    if cw.is_empty() || cw.len() > CODEWORD_WIDTH || !cw.chars().all(|c| c == '0' || c == '1') {
        return Err(McError::Instruction(format!("malformed codeword '{}'", cw)));
    }
    u32::from_str_radix(cw, 2).map_err(|e| McError::Instruction(format!("'{}': {}", cw, e)))
}

/// Sum of two codewords as a 7-bit codeword.
pub fn add_codewords_w7(a: &str, b: &str) -> AppResult<String> {
    let sum = parse_codeword(a)? + parse_codeword(b)?;
    if sum >= 1 << CODEWORD_WIDTH {
        return Err(McError::Instruction(format!(
            "{} + {} overflows {} bits",
            a, b, CODEWORD_WIDTH
        )));
    }
    Ok(format!("{:07b}", sum))
}

/// Trigger `channel` for `duration` clock cycles.
pub fn trigger_channel_instruction(channel: u8, duration: u32) -> AppResult<String> {
    if duration < 1 {
        return Err(McError::Instruction(
            "duration must be at least 1 clock".to_string(),
        ));
    }
    let cw = trigger_codeword(channel)?;
    Ok(format!("trigger {}, {} \nwait {}\n", cw, duration, duration))
}

/// Present `codeword` on `cw_channels`, then raise `trigger_channel` on top.
pub fn qwg_codeword_trigger(
    codeword: u64,
    trigger_channel: u8,
    cw_channels: &[u8],
) -> AppResult<String> {
    if cw_channels.is_empty() {
        return Err(McError::Instruction("no codeword channels given".to_string()));
    }
    let bits = int_to_bin(codeword, cw_channels.len(), false)?;

    let mut marker = vec!['0'; CODEWORD_WIDTH];
    for (bit, channel) in bits.chars().zip(cw_channels) {
        check_channel(*channel)?;
        marker[usize::from(*channel) - 1] = bit;
    }
    let marker: String = marker.into_iter().collect();

    let trigger = trigger_codeword(trigger_channel)?;
    let ready = add_codewords_w7(&trigger, &marker)?;
    Ok(format!(
        "trigger {}, 1\nwait 1\ntrigger {}, 2\nwait 2\n",
        marker, ready
    ))
}

/// [`qwg_codeword_trigger`] on trigger channel 1 and codeword channels 2-4.
pub fn qwg_codeword_trigger_default(codeword: u64) -> AppResult<String> {
    qwg_codeword_trigger(codeword, 1, &[2, 3, 4])
}
