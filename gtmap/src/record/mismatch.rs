/// A difference between the read and the reference inside one map block.
///
/// Positions are 0-based offsets into the read, unlike map positions which
/// are 1-based genomic coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mismatch {
    /// The reference carries `base` where the read differs.
    Substitution { position: usize, base: u8 },
    /// `size` read bases absent from the reference.
    Insertion { position: usize, size: usize },
    /// `size` reference bases absent from the read.
    Deletion { position: usize, size: usize },
}

impl Mismatch {
    pub fn position(&self) -> usize {
        match self {
            Mismatch::Substitution { position, .. }
            | Mismatch::Insertion { position, .. }
            | Mismatch::Deletion { position, .. } => *position,
        }
    }

    pub fn is_substitution(&self) -> bool {
        matches!(self, Mismatch::Substitution { .. })
    }

    /// Edit operations this event contributes to the levenshtein distance.
    pub fn levenshtein(&self) -> u64 {
        match self {
            Mismatch::Substitution { .. } => 1,
            Mismatch::Insertion { size, .. } | Mismatch::Deletion { size, .. } => *size as u64,
        }
    }
}
