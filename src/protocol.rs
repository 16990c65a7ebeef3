//! UHFReader18 wire protocol.
//!
//! Outbound frame: `Len | Adr | Cmd | Payload(n) | CRC_L | CRC_H` with `Len = n + 4`.
//! Inbound frame adds a status byte: `Len | Adr | Cmd | Status | Data(n) | CRC_L | CRC_H`
//! with `Len = n + 5`. `Len` counts every byte after itself.

use crate::types::{Frame, InventoryG2Tag, ReaderError, ReaderInfo, SingleInventoryResult};

// Command codes
pub const CMD_INVENTORY: u8 = 0x01;
pub const CMD_INVENTORY_SINGLE: u8 = 0x0F;
pub const CMD_GET_READER_INFO: u8 = 0x21;
pub const CMD_SET_REGION: u8 = 0x22;
pub const CMD_SET_SCAN_TIME: u8 = 0x25;
pub const CMD_SET_OUTPUT_POWER: u8 = 0x2F;
pub const CMD_ACOUSTO_OPTIC: u8 = 0x33;
pub const CMD_SET_WORK_MODE: u8 = 0x35;
pub const CMD_GET_WORK_MODE: u8 = 0x36;
pub const CMD_SET_ANTENNA_MUX: u8 = 0x3F;

// Response status codes
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_NO_TAG: u8 = 0x01;
pub const STATUS_ANTENNA_ERROR: u8 = 0xF8;
pub const STATUS_NO_TAG_OR_TIMEOUT: u8 = 0xFB;
pub const STATUS_CMD_ERROR: u8 = 0xFE;
pub const STATUS_CRC_ERROR: u8 = 0xFF;

pub const DEFAULT_READER_ADDRESS: u8 = 0x00;
pub const BROADCAST_READER_ADDRESS: u8 = 0xFF;

/// Smallest frame that can carry a checksum: Len, Adr, Cmd, one byte, CRC(2)
pub const MIN_FRAME_LEN: usize = 6;

const CRC_POLY: u16 = 0x8408;

/// CRC-16/MCRF4XX (poly 0x8408 reflected, init 0xFFFF, no final xor)
pub fn crc16_mcrf4xx(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build one wire packet for `command` with `payload`. CRC is appended low byte first.
pub fn build_command(address: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 4) as u8;

    let mut packet = Vec::with_capacity(length as usize + 1);
    packet.extend_from_slice(&[length, address, command]);
    packet.extend_from_slice(payload);

    let crc = crc16_mcrf4xx(&packet);
    packet.push((crc & 0xFF) as u8);
    packet.push((crc >> 8) as u8);
    packet
}

/// Check length byte and trailing CRC of a complete packet.
pub fn verify_packet(packet: &[u8]) -> bool {
    if packet.len() < MIN_FRAME_LEN {
        return false;
    }
    if packet[0] as usize + 1 != packet.len() {
        return false;
    }

    let (body, crc) = packet.split_at(packet.len() - 2);
    let expected = crc16_mcrf4xx(body);
    crc[0] == (expected & 0xFF) as u8 && crc[1] == (expected >> 8) as u8
}

/// Decode as many checksummed frames as `stream` holds.
///
/// Returns the frames in stream order plus the unconsumed tail, which the
/// caller keeps and prepends to the next chunk. A length byte that cannot
/// describe a frame, or a candidate that fails its CRC, costs exactly one
/// byte so a real frame hiding behind garbage is still found.
pub fn parse_frames(stream: &[u8]) -> (Vec<Frame>, Vec<u8>) {
    let mut frames = Vec::new();
    let mut buf = stream;

    while buf.len() >= MIN_FRAME_LEN {
        let total = buf[0] as usize + 1;
        if total < MIN_FRAME_LEN {
            buf = &buf[1..];
            continue;
        }
        if total > buf.len() {
            break;
        }

        let raw = &buf[..total];
        if !verify_packet(raw) {
            buf = &buf[1..];
            continue;
        }

        frames.push(Frame {
            length: raw[0],
            address: raw[1],
            command: raw[2],
            status: raw[3],
            data: raw[4..total - 2].to_vec(),
            raw: raw.to_vec(),
        });
        buf = &buf[total..];
    }

    (frames, buf.to_vec())
}

/// One-shot inventory (0x01) with no payload
pub fn inventory_single_command(address: u8) -> Vec<u8> {
    build_command(address, CMD_INVENTORY, &[])
}

/// Legacy inventory (0x01) carrying a TID address/length payload
pub fn inventory_command(address: u8, tid_addr: u8, tid_len: u8) -> Vec<u8> {
    build_command(address, CMD_INVENTORY, &[tid_addr, tid_len])
}

/// Gen2 inventory (0x01).
///
/// With `tid_len == 0` the payload is `Q, Session, Target, Antenna, ScanTime`,
/// otherwise `Q, Session, TIDAddr, TIDLen, Target, Antenna, ScanTime`.
#[allow(clippy::too_many_arguments)]
pub fn inventory_g2_command(
    address: u8,
    q_value: u8,
    session: u8,
    tid_addr: u8,
    tid_len: u8,
    target: u8,
    antenna: u8,
    scan_time: u8,
) -> Vec<u8> {
    if tid_len == 0 {
        build_command(
            address,
            CMD_INVENTORY,
            &[q_value, session, target, antenna, scan_time],
        )
    } else {
        build_command(
            address,
            CMD_INVENTORY,
            &[q_value, session, tid_addr, tid_len, target, antenna, scan_time],
        )
    }
}

/// Single-tag inventory (0x0F)
pub fn inventory_single_tag_command(address: u8) -> Vec<u8> {
    build_command(address, CMD_INVENTORY_SINGLE, &[])
}

pub fn get_reader_info_command(address: u8) -> Vec<u8> {
    build_command(address, CMD_GET_READER_INFO, &[])
}

/// Inventory duration in 100 ms units
pub fn set_scan_time_command(address: u8, value: u8) -> Vec<u8> {
    build_command(address, CMD_SET_SCAN_TIME, &[value])
}

pub fn set_output_power_command(address: u8, value: u8) -> Vec<u8> {
    build_command(address, CMD_SET_OUTPUT_POWER, &[value])
}

/// Frequency window as high/low channel bytes (0x22)
pub fn set_frequency_range_command(address: u8, high: u8, low: u8) -> Vec<u8> {
    build_command(address, CMD_SET_REGION, &[high, low])
}

pub fn set_work_mode_command(address: u8, payload: &[u8]) -> Vec<u8> {
    build_command(address, CMD_SET_WORK_MODE, payload)
}

pub fn get_work_mode_command(address: u8) -> Vec<u8> {
    build_command(address, CMD_GET_WORK_MODE, &[])
}

/// Active antenna bitmask, bit 0 = antenna 1
pub fn set_antenna_mux_command(address: u8, mask: u8) -> Vec<u8> {
    build_command(address, CMD_SET_ANTENNA_MUX, &[mask])
}

/// Tag count of a legacy inventory response.
///
/// Any non-success status reads as zero tags; only a non-inventory frame is an error.
pub fn inventory_tag_count(frame: &Frame) -> Result<usize, ReaderError> {
    if frame.command != CMD_INVENTORY {
        return Err(ReaderError::NotInventoryFrame);
    }
    if frame.status != STATUS_SUCCESS {
        return Ok(0);
    }
    Ok(frame.data.first().copied().unwrap_or(0) as usize)
}

/// Decode the tag list of a G2 inventory response.
///
/// Layout: `AntMask(1) TagNum(1)` then `TagNum` times `EpcLen(1) EPC(EpcLen) RSSI(1)`.
pub fn parse_inventory_g2_tags(frame: &Frame) -> Result<Vec<InventoryG2Tag>, ReaderError> {
    if frame.command != CMD_INVENTORY {
        return Err(ReaderError::NotInventoryFrame);
    }
    let data = &frame.data;
    if data.len() < 2 {
        return Ok(Vec::new());
    }

    let tag_num = data[1] as usize;
    let antenna = antenna_id_from_mask(data[0]);
    let mut cursor = 2;
    let mut tags = Vec::with_capacity(tag_num);

    for tag in 0..tag_num {
        if cursor >= data.len() {
            return Err(ReaderError::Truncated { tag });
        }
        let epc_len = data[cursor] as usize;
        cursor += 1;
        if epc_len == 0 || cursor + epc_len > data.len() {
            return Err(ReaderError::InvalidEpcLength { tag });
        }

        let epc = data[cursor..cursor + epc_len].to_vec();
        cursor += epc_len;
        if cursor >= data.len() {
            return Err(ReaderError::MissingRssi { tag });
        }
        let rssi = data[cursor];
        cursor += 1;

        tags.push(InventoryG2Tag { antenna, epc, rssi });
    }

    Ok(tags)
}

/// Decode a single-tag inventory response: `Ant(1) Count(1) EpcLen(1) EPC(EpcLen)`
pub fn parse_single_inventory_result(frame: &Frame) -> Result<SingleInventoryResult, ReaderError> {
    if frame.command != CMD_INVENTORY_SINGLE {
        return Err(ReaderError::NotSingleInventoryFrame);
    }
    if frame.status != STATUS_NO_TAG && frame.status != STATUS_SUCCESS {
        return Err(ReaderError::UnexpectedStatus(frame.status));
    }
    let data = &frame.data;
    if data.len() < 3 {
        return Err(ReaderError::PayloadTooShort {
            need: 3,
            got: data.len(),
        });
    }

    let epc_len = data[2] as usize;
    if data.len() < 3 + epc_len {
        return Err(ReaderError::InvalidEpcLength { tag: 0 });
    }

    Ok(SingleInventoryResult {
        antenna: data[0],
        tag_count: data[1],
        epc: data[3..3 + epc_len].to_vec(),
    })
}

impl ReaderInfo {
    /// Decode a successful get-reader-info response.
    ///
    /// Layout: `Version(2) Type(1) Protocols(1) MaxFreq(1) MinFreq(1) Power(1) ScanTime(1)`
    pub fn parse(frame: &Frame) -> Result<Self, ReaderError> {
        if frame.command != CMD_GET_READER_INFO {
            return Err(ReaderError::NotReaderInfoFrame);
        }
        if frame.status != STATUS_SUCCESS {
            return Err(ReaderError::UnexpectedStatus(frame.status));
        }
        let d = &frame.data;
        if d.len() < 8 {
            return Err(ReaderError::PayloadTooShort {
                need: 8,
                got: d.len(),
            });
        }

        Ok(Self {
            version: (d[0], d[1]),
            reader_type: d[2],
            protocols: d[3],
            max_frequency: d[4],
            min_frequency: d[5],
            power: d[6],
            scan_time: d[7],
        })
    }
}

/// Map an antenna bitmask to an antenna number.
///
/// Single-bit masks give 1..=8. Any other mask falls back to `mask + 1`,
/// which downstream logs rely on, so multi-antenna masks are not decoded further.
pub fn antenna_id_from_mask(mask: u8) -> u16 {
    match mask {
        0x01 => 1,
        0x02 => 2,
        0x04 => 3,
        0x08 => 4,
        0x10 => 5,
        0x20 => 6,
        0x40 => 7,
        0x80 => 8,
        _ => mask as u16 + 1,
    }
}

/// Human label for a response status byte
pub fn status_label(status: u8) -> &'static str {
    match status {
        STATUS_SUCCESS => "success",
        STATUS_NO_TAG => "no tag",
        0x02 => "inventory timeout",
        0x03 => "more data",
        0x04 => "memory full",
        STATUS_ANTENNA_ERROR => "antenna error",
        STATUS_NO_TAG_OR_TIMEOUT => "no tag or timeout",
        STATUS_CMD_ERROR => "illegal command",
        STATUS_CRC_ERROR => "parameter error",
        _ => "unknown",
    }
}
