//! Structured view over a refclock driver's parameter string.
//!
//! The original walks a colon-tokenised C string in place, rewriting each
//! `:` to `NUL` and handing the driver a `char **argv`-style array
//! (`refclock.c`'s `RCL_AddRefclock`). Here the declaration line is parsed
//! once into a `RefclockParams` that exposes positional and key/value access
//! without any in-place string mutation.

/// A refclock driver parameter string such as `/var/run/gpsd.sock:115200`,
/// split on `:` into ordered fields. Drivers index into it positionally;
/// nothing here interprets the fields — that's driver-specific.
#[derive(Debug, Clone, Default)]
pub struct RefclockParams {
    fields: Vec<String>,
}

impl RefclockParams {
    pub fn parse(raw: &str) -> Self {
        Self {
            fields: raw.split(':').map(str::to_string).collect(),
        }
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_colon() {
        let p = RefclockParams::parse("/dev/ttyS0:4800:8n1");
        assert_eq!(p.len(), 3);
        assert_eq!(p.field(0), Some("/dev/ttyS0"));
        assert_eq!(p.field(1), Some("4800"));
        assert_eq!(p.field(3), None);
    }

    #[test]
    fn empty_string_yields_one_empty_field() {
        let p = RefclockParams::parse("");
        assert_eq!(p.len(), 1);
        assert_eq!(p.field(0), Some(""));
    }
}
