/// The crc32 checksum of raw image bytes.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::default();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_the_reference_value() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }
}
