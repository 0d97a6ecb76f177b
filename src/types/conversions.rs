use ethers::types::Address;
use ethers::utils::to_checksum;
use std::str::FromStr;

/// Parses and validates a user-supplied address.
///
/// Accepts any casing. Mixed-case input must carry a valid EIP-55 checksum; all-lower
/// and all-upper input is accepted as-is.
pub fn parse_address(s: &str) -> Result<Address, ConversionError> {
    let trimmed = s.trim();
    let address =
        Address::from_str(trimmed).map_err(|e| ConversionError::InvalidAddress(format!("{}: {}", s, e)))?;

    let hex_part = trimmed.trim_start_matches("0x");
    let is_mixed_case = hex_part.chars().any(|c| c.is_ascii_lowercase())
        && hex_part.chars().any(|c| c.is_ascii_uppercase());
    if is_mixed_case && to_checksum(&address, None).trim_start_matches("0x") != hex_part {
        return Err(ConversionError::InvalidAddress(format!(
            "{}: checksum mismatch",
            s
        )));
    }
    Ok(address)
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
