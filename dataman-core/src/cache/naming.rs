//! Guessing which dataset files the instrument will write next.
//!
//! Dataset files are numbered sequentially (`N20060627S0001.fits`,
//! `N20060627S0002.fits`, ...). Announcing the next few names to the change
//! source lets it suppress the duplicate events it would otherwise emit
//! while those files are being written.

/// The `count` names following the lexically greatest of `file_names`.
///
/// Returns nothing when that name carries no trailing sequence number.
pub fn predict_next<'a>(
    file_names: impl IntoIterator<Item = &'a str>,
    count: usize,
) -> Vec<String> {
    let Some(last) = file_names.into_iter().max() else {
        return Vec::new();
    };
    let Some(sequence) = SequencedName::parse(last) else {
        return Vec::new();
    };
    (1..=count as u64)
        .filter_map(|step| sequence.nth(step))
        .collect()
}

struct SequencedName<'a> {
    prefix: &'a str,
    number: u64,
    width: usize,
    suffix: &'a str,
}

impl<'a> SequencedName<'a> {
    fn parse(name: &'a str) -> Option<Self> {
        let (stem, suffix) = match name.rfind('.') {
            Some(dot) if dot > 0 => name.split_at(dot),
            _ => (name, ""),
        };
        let digits = stem
            .bytes()
            .rev()
            .take_while(|byte| byte.is_ascii_digit())
            .count();
        if digits == 0 {
            return None;
        }
        let (prefix, number) = stem.split_at(stem.len() - digits);
        Some(Self {
            prefix,
            number: number.parse().ok()?,
            width: digits,
            suffix,
        })
    }

    fn nth(&self, step: u64) -> Option<String> {
        let number = self.number.checked_add(step)?;
        Some(format!(
            "{}{:0width$}{}",
            self.prefix,
            number,
            self.suffix,
            width = self.width
        ))
    }
}
