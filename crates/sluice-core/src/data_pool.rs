//! Lazy record generators.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::config::DataPoolDescriptor;
use crate::error::AppError;

/// Declared size of a data pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSize {
    Finite(u64),
    Unbounded,
}

impl PoolSize {
    /// Progress denominator; zero for unbounded pools, which report no progress.
    pub fn total(&self) -> u64 {
        match self {
            PoolSize::Finite(n) => *n,
            PoolSize::Unbounded => 0,
        }
    }
}

type Records = Box<dyn Iterator<Item = String> + Send>;

/// A lazy, possibly infinite sequence of input records plus its declared size.
pub struct DataPool {
    records: Records,
    size: PoolSize,
}

impl DataPool {
    pub fn new(records: impl Iterator<Item = String> + Send + 'static, size: PoolSize) -> Self {
        Self {
            records: Box::new(records),
            size,
        }
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        let size = PoolSize::Finite(lines.len() as u64);
        Self::new(lines.into_iter(), size)
    }

    /// Stream the non-blank lines of a file. The file is scanned once up
    /// front to count records; lines are then read lazily as they are
    /// dispatched.
    pub fn wordlist(path: &Path) -> Result<Self, AppError> {
        let count = BufReader::new(File::open(path)?)
            .lines()
            .try_fold(0u64, |n, line| {
                line.map(|l| if l.trim().is_empty() { n } else { n + 1 })
            })?;

        let shown = path.display().to_string();
        let lines = BufReader::new(File::open(path)?)
            .lines()
            .map_while(move |line| match line {
                Ok(line) => Some(line),
                Err(e) => {
                    tracing::warn!(path = %shown, error = %e, "Wordlist read failed, ending pool");
                    None
                }
            })
            .map(|line| line.trim_end_matches(['\r', '\n']).to_string())
            .filter(|line| !line.trim().is_empty());

        Ok(Self::new(lines, PoolSize::Finite(count)))
    }

    /// `amount` numbers `start, start + step, ...`, left-padded with zeros to `pad` digits.
    pub fn range(start: i64, amount: u64, step: i64, pad: usize) -> Self {
        let numbers = (0..amount).map(move |i| {
            let n = start.saturating_add((i as i64).saturating_mul(step));
            format!("{n:0pad$}")
        });
        Self::new(numbers, PoolSize::Finite(amount))
    }

    /// Every string of `length` characters over `charset`, in odometer
    /// order. Duplicate characters in the charset are ignored.
    pub fn combinations(charset: &str, length: u32) -> Result<Self, AppError> {
        let mut chars: Vec<char> = Vec::new();
        for c in charset.chars() {
            if !chars.contains(&c) {
                chars.push(c);
            }
        }
        if chars.is_empty() || length == 0 {
            return Err(AppError::ConfigError(
                "combinations need a non-empty charset and a length of at least 1".into(),
            ));
        }

        let base = chars.len() as u64;
        let total = base.checked_pow(length).ok_or_else(|| {
            AppError::ConfigError(format!(
                "{base}^{length} combinations exceed the supported range"
            ))
        })?;

        let combos = (0..total).map(move |mut n| {
            let mut word = vec![chars[0]; length as usize];
            for slot in word.iter_mut().rev() {
                *slot = chars[(n % base) as usize];
                n /= base;
            }
            word.into_iter().collect::<String>()
        });
        Ok(Self::new(combos, PoolSize::Finite(total)))
    }

    /// Counter records `0, 1, 2, ...`.
    pub fn infinite() -> Self {
        Self::new((0u64..).map(|i| i.to_string()), PoolSize::Unbounded)
    }

    pub fn from_descriptor(descriptor: &DataPoolDescriptor) -> Result<Self, AppError> {
        match descriptor {
            DataPoolDescriptor::Wordlist { path } => Self::wordlist(path),
            DataPoolDescriptor::Lines { lines } => Ok(Self::from_lines(lines.clone())),
            DataPoolDescriptor::Range {
                start,
                amount,
                step,
                pad,
            } => Ok(Self::range(*start, *amount, *step, *pad)),
            DataPoolDescriptor::Combinations { charset, length } => {
                Self::combinations(charset, *length)
            }
            DataPoolDescriptor::Infinite => Ok(Self::infinite()),
        }
    }

    pub fn size(&self) -> PoolSize {
        self.size
    }

    pub fn into_parts(self) -> (Records, PoolSize) {
        (self.records, self.size)
    }
}

impl std::fmt::Debug for DataPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPool").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn collect(pool: DataPool) -> Vec<String> {
        pool.into_parts().0.collect()
    }

    #[test]
    fn test_wordlist_counts_and_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "alpha\r\n\n  \nbeta\ngamma").unwrap();

        let pool = DataPool::wordlist(file.path()).unwrap();
        assert_eq!(pool.size(), PoolSize::Finite(3));
        assert_eq!(collect(pool), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_wordlist_missing_file_is_io_error() {
        let result = DataPool::wordlist(Path::new("/definitely/not/here.txt"));
        assert!(matches!(result, Err(AppError::IoError(_))));
    }

    #[test]
    fn test_range_with_padding_and_step() {
        let pool = DataPool::range(8, 3, 2, 3);
        assert_eq!(pool.size(), PoolSize::Finite(3));
        assert_eq!(collect(pool), vec!["008", "010", "012"]);
    }

    #[test]
    fn test_combinations_in_odometer_order() {
        let pool = DataPool::combinations("ab", 2).unwrap();
        assert_eq!(pool.size(), PoolSize::Finite(4));
        assert_eq!(collect(pool), vec!["aa", "ab", "ba", "bb"]);

        assert!(DataPool::combinations("", 2).is_err());
        assert!(DataPool::combinations("0123456789", 30).is_err());
    }

    #[test]
    fn test_infinite_is_unbounded() {
        let pool = DataPool::infinite();
        assert_eq!(pool.size().total(), 0);
        let first: Vec<String> = pool.into_parts().0.take(3).collect();
        assert_eq!(first, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_from_descriptor_lines() {
        let pool = DataPool::from_descriptor(&DataPoolDescriptor::Lines {
            lines: vec!["x".into(), "y".into()],
        })
        .unwrap();
        assert_eq!(pool.size(), PoolSize::Finite(2));
    }
}
