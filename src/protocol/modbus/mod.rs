mod frame;

use rmodbus::{client::ModbusRequest, ModbusProto};

use super::{
    error::TransportError,
    transaction::{BusRequest, FunctionCode, Payload, TransactionData},
};

pub use frame::{expected_reply_len, read_rtu_reply};

/// An encoded RTU request together with the `rmodbus` state needed to validate its reply.
pub struct RtuExchange {
    request: ModbusRequest,
    function: FunctionCode,
    address: u16,
    quantity: u16,
    pub frame: Vec<u8>,
}

fn encode_error(err: impl std::fmt::Debug) -> TransportError {
    TransportError::Malformed(format!("failed to encode request: {err:?}"))
}

/// Build the RTU frame for one bus request.
pub fn encode_request(req: &BusRequest) -> Result<RtuExchange, TransportError> {
    let mut request = ModbusRequest::new(req.unit, ModbusProto::Rtu);
    let mut frame = Vec::new();

    match (req.function, &req.payload) {
        (FunctionCode::ReadCoils, Payload::Count(count)) => request
            .generate_get_coils(req.address, *count, &mut frame)
            .map_err(encode_error)?,
        (FunctionCode::ReadDiscreteInputs, Payload::Count(count)) => request
            .generate_get_discretes(req.address, *count, &mut frame)
            .map_err(encode_error)?,
        (FunctionCode::ReadHoldingRegisters, Payload::Count(count)) => request
            .generate_get_holdings(req.address, *count, &mut frame)
            .map_err(encode_error)?,
        (FunctionCode::ReadInputRegisters, Payload::Count(count)) => request
            .generate_get_inputs(req.address, *count, &mut frame)
            .map_err(encode_error)?,
        (FunctionCode::WriteSingleCoil, Payload::Values(values)) if values.len() == 1 => request
            .generate_set_coil(req.address, values[0] != 0, &mut frame)
            .map_err(encode_error)?,
        (FunctionCode::WriteSingleRegister, Payload::Values(values)) if values.len() == 1 => {
            request
                .generate_set_holding(req.address, values[0], &mut frame)
                .map_err(encode_error)?
        }
        (FunctionCode::WriteMultipleCoils, Payload::Values(values)) if !values.is_empty() => {
            let coils: Vec<bool> = values.iter().map(|&v| v != 0).collect();
            request
                .generate_set_coils_bulk(req.address, &coils, &mut frame)
                .map_err(encode_error)?
        }
        (FunctionCode::WriteMultipleRegisters, Payload::Values(values)) if !values.is_empty() => {
            request
                .generate_set_holdings_bulk(req.address, values, &mut frame)
                .map_err(encode_error)?
        }
        (function, payload) => {
            return Err(TransportError::Malformed(format!(
                "payload {payload:?} does not fit function {function}"
            )))
        }
    }

    Ok(RtuExchange {
        request,
        function: req.function,
        address: req.address,
        quantity: req.quantity(),
        frame,
    })
}

impl RtuExchange {
    pub fn expected_reply_len(&self) -> usize {
        expected_reply_len(self.function, self.quantity)
    }

    /// Validate a raw reply and extract its data.
    pub fn decode_reply(&self, reply: &[u8]) -> Result<TransactionData, TransportError> {
        if reply.len() < 5 {
            return Err(TransportError::Malformed(format!(
                "reply too short (len={}, need >=5)",
                reply.len()
            )));
        }
        if reply[1] & 0x80 != 0 {
            return Err(TransportError::Exception {
                function: reply[1] & 0x7F,
                code: reply[2],
            });
        }
        self.request
            .parse_ok(reply)
            .map_err(|err| TransportError::Malformed(format!("{err:?}")))?;

        if self.function.kind() == super::transaction::TransactionKind::Write {
            return Ok(TransactionData::Written {
                address: self.address,
                quantity: self.quantity,
            });
        }

        let body = &reply[3..reply.len() - 2];
        let values = if self.function.register_mode().is_bit() {
            unpack_bits(body, self.quantity)
        } else {
            body.chunks_exact(2)
                .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                .collect()
        };

        Ok(TransactionData::Registers {
            address: self.address,
            values,
        })
    }
}

/// Coils and discrete inputs come back LSB-first, padded to whole bytes.
pub fn unpack_bits(bytes: &[u8], quantity: u16) -> Vec<u16> {
    let mut values = Vec::with_capacity(quantity as usize);
    for byte_val in bytes {
        for bit_idx in 0..8 {
            if values.len() >= quantity as usize {
                return values;
            }
            values.push(u16::from(byte_val & (1 << bit_idx) != 0));
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(function: FunctionCode, address: u16, payload: Payload) -> BusRequest {
        BusRequest {
            id: "t".into(),
            unit: 1,
            function,
            address,
            payload,
        }
    }

    #[test]
    fn read_holdings_frame_layout() {
        let exchange = encode_request(&request(
            FunctionCode::ReadHoldingRegisters,
            0x0010,
            Payload::Count(2),
        ))
        .unwrap();
        assert_eq!(&exchange.frame[..6], &[0x01, 0x03, 0x00, 0x10, 0x00, 0x02]);
        assert_eq!(exchange.frame.len(), 8);
        assert_eq!(exchange.expected_reply_len(), 9);
    }

    #[test]
    fn exception_reply_is_reported_as_exception() {
        let exchange = encode_request(&request(
            FunctionCode::ReadHoldingRegisters,
            0,
            Payload::Count(1),
        ))
        .unwrap();
        let err = exchange
            .decode_reply(&[0x01, 0x83, 0x02, 0xC0, 0xF1])
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Exception {
                function: 0x03,
                code: 0x02
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let result = encode_request(&request(
            FunctionCode::WriteSingleRegister,
            0,
            Payload::Count(1),
        ));
        assert!(matches!(result, Err(TransportError::Malformed(_))));
    }

    #[test]
    fn bits_unpack_lsb_first() {
        assert_eq!(unpack_bits(&[0b0000_0101], 3), vec![1, 0, 1]);
        assert_eq!(unpack_bits(&[0xFF, 0x01], 9).len(), 9);
    }
}
