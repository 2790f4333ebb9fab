use alloy_primitives::{I256, U256};
use bytes::BufMut;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};

const NBASE: u64 = 10_000;
const SIGN_NEGATIVE: u16 = 0x4000;

/// Unsigned 256-bit wei value stored as postgres NUMERIC.
///
/// NUMERIC's wire format is a sequence of base-10000 digit groups with a
/// weight for the first group; postgres strips trailing zero groups when it
/// stores values, so decoding has to honor the weight rather than assume the
/// groups are dense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgNumeric(pub U256);

impl From<U256> for PgNumeric {
    fn from(value: U256) -> Self {
        PgNumeric(value)
    }
}

impl From<PgNumeric> for U256 {
    fn from(value: PgNumeric) -> Self {
        value.0
    }
}

/// Signed 256-bit wei value stored as postgres NUMERIC. Balance deltas and
/// bid adjustments may be negative, so the sign word is honored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgSignedNumeric(pub I256);

impl From<I256> for PgSignedNumeric {
    fn from(value: I256) -> Self {
        PgSignedNumeric(value)
    }
}

impl From<PgSignedNumeric> for I256 {
    fn from(value: PgSignedNumeric) -> Self {
        value.0
    }
}

fn read_two_bytes(raw: &[u8], offset: &mut usize) -> std::io::Result<u16> {
    if raw.len() < *offset + 2 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Not enough bytes to read",
        ));
    }
    let value = u16::from_be_bytes([raw[*offset], raw[*offset + 1]]);
    *offset += 2;
    Ok(value)
}

fn decode_magnitude(raw: &[u8]) -> Result<(U256, u16), Box<dyn std::error::Error + Sync + Send>> {
    let n_base = U256::from(NBASE);
    let mut offset = 0;

    let num_groups = read_two_bytes(raw, &mut offset)?;
    let weight = read_two_bytes(raw, &mut offset)?;
    let sign = read_two_bytes(raw, &mut offset)?;
    let _dscale = read_two_bytes(raw, &mut offset)?;

    let mut value = U256::ZERO;
    for _ in 0..num_groups {
        value = value * n_base + U256::from(read_two_bytes(raw, &mut offset)?);
    }

    value *= n_base.pow(U256::from((weight + 1).saturating_sub(num_groups)));

    Ok((value, sign))
}

fn encode_magnitude(value: U256, negative: bool, out: &mut bytes::BytesMut) {
    const MAX_GROUP_COUNT: usize = 32;
    let divisor = U256::from(NBASE);
    let mut temp = value;
    let mut digits = [0i16; MAX_GROUP_COUNT];
    let mut num_digits = 0;

    while temp != U256::ZERO {
        let (quotient, remainder) = temp.div_rem(divisor);
        digits[num_digits] = remainder.as_limbs()[0] as i16;
        num_digits += 1;
        temp = quotient;
    }

    if num_digits == 0 {
        num_digits = 1;
    }
    let weight = (num_digits as i16).saturating_sub(1);

    out.reserve(8 + num_digits * 2);

    out.put_u16(num_digits as u16);
    out.put_i16(weight);
    out.put_u16(if negative { SIGN_NEGATIVE } else { 0 });
    out.put_u16(0);

    for digit in digits.iter().take(num_digits).rev() {
        out.put_i16(*digit);
    }
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_: &Type, raw: &[u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let (value, sign) = decode_magnitude(raw)?;
        if sign == SIGN_NEGATIVE {
            return Err("negative NUMERIC for unsigned column".into());
        }
        Ok(PgNumeric(value))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::NUMERIC)
    }
}

impl ToSql for PgNumeric {
    fn to_sql(
        &self,
        _: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        encode_magnitude(self.0, false, out);
        Ok(IsNull::No)
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::NUMERIC)
    }

    tokio_postgres::types::to_sql_checked!();
}

impl<'a> FromSql<'a> for PgSignedNumeric {
    fn from_sql(_: &Type, raw: &[u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let (magnitude, sign) = decode_magnitude(raw)?;
        let value = I256::try_from(magnitude).map_err(|_| "NUMERIC magnitude overflows I256")?;
        Ok(PgSignedNumeric(if sign == SIGN_NEGATIVE { -value } else { value }))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::NUMERIC)
    }
}

impl ToSql for PgSignedNumeric {
    fn to_sql(
        &self,
        _: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        encode_magnitude(self.0.unsigned_abs(), self.0.is_negative(), out);
        Ok(IsNull::No)
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::NUMERIC)
    }

    tokio_postgres::types::to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned_values() -> Vec<U256> {
        vec![
            U256::ZERO,
            U256::from(1u64),
            U256::from(12_345_678u64),
            U256::from(12_088_888_526_885_516u64),
            U256::from(u64::MAX),
            U256::from_str_radix("1000000000000000000", 10).unwrap(),
            U256::from_str_radix("1000000000000000000000000000000000000000000000", 10).unwrap(),
            U256::MAX,
        ]
    }

    #[test]
    fn unsigned_round_trip() {
        for value in unsigned_values() {
            let mut bytes = bytes::BytesMut::new();
            PgNumeric::from(value).to_sql(&Type::NUMERIC, &mut bytes).unwrap();
            let decoded = PgNumeric::from_sql(&Type::NUMERIC, &bytes[..]).unwrap();
            assert_eq!(decoded.0, value);
        }
    }

    #[test]
    fn signed_round_trip() {
        let values = vec![
            I256::ZERO,
            I256::try_from(1i64).unwrap(),
            I256::try_from(-1i64).unwrap(),
            I256::try_from(52_000_000_000_000_000i64).unwrap(),
            I256::try_from(-20_000_000_000_000_000i64).unwrap(),
            I256::MAX,
            I256::MIN + I256::try_from(1i64).unwrap(),
        ];
        for value in values {
            let mut bytes = bytes::BytesMut::new();
            PgSignedNumeric::from(value).to_sql(&Type::NUMERIC, &mut bytes).unwrap();
            let decoded = PgSignedNumeric::from_sql(&Type::NUMERIC, &bytes[..]).unwrap();
            assert_eq!(decoded.0, value);
        }
    }

    #[test]
    fn negative_rejected_for_unsigned() {
        let mut bytes = bytes::BytesMut::new();
        PgSignedNumeric::from(I256::try_from(-5i64).unwrap())
            .to_sql(&Type::NUMERIC, &mut bytes)
            .unwrap();
        assert!(PgNumeric::from_sql(&Type::NUMERIC, &bytes[..]).is_err());
    }

    #[test]
    fn trailing_zero_groups_are_restored() {
        // A single group [1] with weight 4 decodes to 10000^4 = 10^16.
        let mut bytes = bytes::BytesMut::new();
        bytes.put_u16(1); // num groups
        bytes.put_i16(4); // weight
        bytes.put_u16(0); // sign
        bytes.put_u16(0); // dscale
        bytes.put_i16(1);
        let decoded = PgNumeric::from_sql(&Type::NUMERIC, &bytes[..]).unwrap();
        assert_eq!(decoded.0, U256::from(10u64).pow(U256::from(16u64)));
    }
}
