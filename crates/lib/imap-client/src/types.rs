//! IMAP domain types shared across the workspace.

use std::fmt;

/// A message fetched from a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned unique identifier, stable within a mailbox.
    pub uid: u32,

    /// Position in the mailbox; shifts after expunge.
    pub seq: u32,

    /// Flags set on the message.
    pub flags: Vec<String>,

    /// Server-recorded arrival time, when reported.
    pub internal_date: Option<chrono::DateTime<chrono::FixedOffset>>,

    /// Raw RFC822 payload.
    pub body: Vec<u8>,
}

/// Status of a selected mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Mailbox name.
    pub name: String,

    /// Number of messages in the mailbox.
    pub exists: u32,

    /// Number of messages with the `\Recent` flag.
    pub recent: u32,

    /// Sequence number of the first unseen message, when reported.
    pub unseen: Option<u32>,
}

impl MailboxStatus {
    /// A name-only placeholder for when the real status is unknown.
    pub fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// A server-pushed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Untagged informational response from the server.
    Status {
        /// Human-readable text, when present.
        information: Option<String>,
    },

    /// The selected mailbox now holds this many messages.
    MailboxSize(u32),

    /// The message at this sequence number was expunged.
    Expunge(u32),

    /// This many messages carry `\Recent`.
    Recent(u32),
}

/// Flag mutation operator for UID STORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// Add the listed flags.
    Add,

    /// Remove the listed flags.
    Remove,

    /// Replace all flags with the listed ones.
    Replace,
}

impl StoreOp {
    /// The STORE data item name for this operator.
    pub(crate) fn item(self) -> &'static str {
        match self {
            Self::Add => "+FLAGS",
            Self::Remove => "-FLAGS",
            Self::Replace => "FLAGS",
        }
    }
}

/// An ordered, coalesced set of message sequence numbers or UIDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeqSet {
    ranges: Vec<(u32, u32)>,
}

impl SeqSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single number.
    pub fn add_num(&mut self, n: u32) {
        self.add_range(n, n);
    }

    /// Add an inclusive range.
    pub fn add_range(&mut self, lo: u32, hi: u32) {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        self.ranges.push((lo, hi));
        self.normalize();
    }

    /// Whether the set contains `n`.
    pub fn contains(&self, n: u32) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= n && n <= hi)
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The number of entries in the set.
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(lo, hi)| (hi - lo + 1) as usize)
            .sum()
    }

    fn normalize(&mut self) {
        self.ranges.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(lo, hi) in &self.ranges {
            match merged.last_mut() {
                Some(last) if lo <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        self.ranges = merged;
    }
}

impl fmt::Display for SeqSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(lo, hi)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if lo == hi {
                write!(f, "{lo}")?;
            } else {
                write!(f, "{lo}:{hi}")?;
            }
        }
        Ok(())
    }
}

impl FromIterator<u32> for SeqSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = Self::new();
        for n in iter {
            set.add_num(n);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_adjacent_numbers() {
        let set: SeqSet = [3, 4, 5, 7, 6, 9].into_iter().collect();
        assert_eq!(set.to_string(), "3:7,9");
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn out_of_order_inserts_merge() {
        let mut set = SeqSet::new();
        set.add_range(11, 23);
        set.add_range(3, 9);
        assert_eq!(set.to_string(), "3:9,11:23");
        assert!(set.contains(3));
        assert!(set.contains(23));
        assert!(!set.contains(10));
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut set = SeqSet::new();
        set.add_num(5);
        set.add_num(5);
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_string(), "5");
    }

    #[test]
    fn empty_set_formats_to_nothing() {
        let set = SeqSet::new();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }
}
