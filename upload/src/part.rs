use backend::{ApiError, PresignedPart};

/// One contiguous byte range of the file, uploaded as an independent PUT.
///
/// The byte range is derived from the part number and the planned part size,
/// never stored by the backend: part `n` covers
/// `[(n-1) * part_size, min(n * part_size, file_size))`. Part numbers start
/// at 1 and cover the file exactly once with no gaps or overlaps.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// 1-based part number.
    ///
    pub part_number: u32,

    /// Inclusive start offset into the file.
    ///
    pub start: u64,

    /// Exclusive end offset into the file.
    ///
    pub end: u64,

    /// Presigned URL accepting this part's bytes.
    ///
    pub url: String,

    /// ETag assigned by object storage; set only after the PUT succeeds.
    ///
    pub etag: Option<String>,

    /// True only once the backend has confirmed `(part_number, etag)`.
    ///
    pub uploaded: bool,
}

impl Part {
    /// Build a part from a presigned URL issued by the backend, deriving its
    /// byte range from the upload's geometry.
    ///
    /// Part numbers are 1-based on the wire; a batch carrying part number 0
    /// violates the contract and is rejected as malformed.
    ///
    pub fn from_presigned(
        presigned: PresignedPart,
        part_size: u64,
        file_size: u64,
    ) -> Result<Self, ApiError> {
        if presigned.part_number == 0 {
            return Err(ApiError::Malformed(
                "presigned batch carried part number 0".to_string(),
            ));
        }

        let start = u64::from(presigned.part_number - 1) * part_size;
        let end = (start + part_size).min(file_size).max(start);
        Ok(Self {
            part_number: presigned.part_number,
            start,
            end,
            url: presigned.url,
            etag: None,
            uploaded: false,
        })
    }

    /// Length of this part in bytes.
    ///
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the part covers no bytes (only possible for an empty file).
    ///
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of parts a file of `file_size` splits into at `part_size`.
///
/// A file smaller than one part (including an empty file) is always a single
/// part.
///
pub fn part_count(file_size: u64, part_size: u64) -> u32 {
    if file_size <= part_size {
        return 1;
    }
    ((file_size + part_size - 1) / part_size) as u32
}

#[cfg(test)]
mod tests {
    use bytesize::MIB;
    use pretty_assertions::assert_eq;

    use super::*;

    fn presigned(part_number: u32) -> PresignedPart {
        PresignedPart {
            part_number,
            url: format!("https://store/p{}", part_number),
        }
    }

    #[test]
    fn test_ranges_cover_file_exactly_once() {
        let file_size = 12 * MIB;
        let part_size = 5 * MIB;
        let count = part_count(file_size, part_size);
        assert_eq!(count, 3);

        let parts: Vec<Part> = (1..=count)
            .map(|n| Part::from_presigned(presigned(n), part_size, file_size).unwrap())
            .collect();

        // Contiguous, starting at 0, ending at file_size.
        assert_eq!(parts[0].start, 0);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(parts.last().unwrap().end, file_size);

        let total: u64 = parts.iter().map(Part::len).sum();
        assert_eq!(total, file_size);
    }

    #[test]
    fn test_twelve_mib_file_with_five_mib_parts() {
        let file_size = 12 * MIB;
        let part_size = 5 * MIB;

        let sizes: Vec<u64> = (1..=part_count(file_size, part_size))
            .map(|n| Part::from_presigned(presigned(n), part_size, file_size).unwrap().len())
            .collect();

        assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);
    }

    #[test]
    fn test_part_count_rounds_up() {
        assert_eq!(part_count(10, 5), 2);
        assert_eq!(part_count(11, 5), 3);
        assert_eq!(part_count(5, 5), 1);
        assert_eq!(part_count(4, 5), 1);
        assert_eq!(part_count(0, 5), 1);
    }

    #[test]
    fn test_empty_file_single_empty_part() {
        let part = Part::from_presigned(presigned(1), 5 * MIB, 0).unwrap();
        assert_eq!(part.len(), 0);
        assert!(part.is_empty());
    }

    #[test]
    fn test_part_number_zero_rejected() {
        let err = Part::from_presigned(presigned(0), 5 * MIB, 12 * MIB).unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[test]
    fn test_part_beyond_file_end_is_empty() {
        // A batch pointing past the end must not produce an inverted range.
        let part = Part::from_presigned(presigned(9), 5 * MIB, 12 * MIB).unwrap();
        assert_eq!(part.len(), 0);
    }
}
