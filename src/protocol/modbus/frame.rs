use rmodbus::{guess_response_frame_len, ModbusProto};
use std::io::Read;

use crate::protocol::{error::TransportError, transaction::FunctionCode};

/// Full RTU reply length (address, function, data, CRC) for a successful reply.
pub fn expected_reply_len(function: FunctionCode, quantity: u16) -> usize {
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            3 + (quantity as usize).div_ceil(8) + 2
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            3 + quantity as usize * 2 + 2
        }
        _ => 8,
    }
}

/// Read one RTU reply from a port whose read timeout is already configured.
///
/// The first three bytes are enough for `rmodbus` to tell the frame length,
/// including exception replies.
pub fn read_rtu_reply<R: Read + ?Sized>(port: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; 3];
    port.read_exact(&mut header)?;

    let len = guess_response_frame_len(&header, ModbusProto::Rtu)
        .map_err(|err| TransportError::Malformed(format!("unrecognised reply header: {err:?}")))?
        as usize;
    if len < header.len() {
        return Err(TransportError::Malformed(format!(
            "reply length {len} shorter than header"
        )));
    }

    let mut frame = header.to_vec();
    frame.resize(len, 0);
    port.read_exact(&mut frame[3..])?;

    log::debug!(
        "Received reply: {}",
        frame
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    );

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_lengths() {
        assert_eq!(expected_reply_len(FunctionCode::ReadCoils, 9), 7);
        assert_eq!(expected_reply_len(FunctionCode::ReadInputRegisters, 4), 13);
        assert_eq!(expected_reply_len(FunctionCode::WriteMultipleCoils, 20), 8);
    }

    #[test]
    fn truncated_stream_is_an_io_error() {
        let mut stream: &[u8] = &[0x01];
        let err = read_rtu_reply(&mut stream).unwrap_err();
        // `read_exact` on a short slice reports UnexpectedEof
        assert!(matches!(err, TransportError::Io(_)));
    }
}
