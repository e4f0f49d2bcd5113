use crate::config::CommConfig;

pub const NUM_PROTOCOLS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Protocol {
    Ll = 0,
    Ll128 = 1,
    Simple = 2,
}

// lines/thread * max threads * steps * line size
const DEFAULT_LL_BUFFSIZE: usize = 8 * 512 * 8 * 16;
// elems/thread * max threads * steps * elem size
const DEFAULT_LL128_BUFFSIZE: usize = 120 * 640 * 8 * 8;
const DEFAULT_BUFFSIZE: usize = 1 << 22;
const DEFAULT_BUFFSIZE_ARM: usize = 1 << 20;

#[derive(Clone, Debug)]
pub struct CommProfile {
    pub buff_sizes: [usize; NUM_PROTOCOLS],
}

impl Default for CommProfile {
    fn default() -> Self {
        CommProfile {
            buff_sizes: [
                DEFAULT_LL_BUFFSIZE,
                DEFAULT_LL128_BUFFSIZE,
                default_simple_buffsize(),
            ],
        }
    }
}

fn default_simple_buffsize() -> usize {
    if cfg!(target_arch = "aarch64") {
        DEFAULT_BUFFSIZE_ARM
    } else {
        DEFAULT_BUFFSIZE
    }
}

impl CommProfile {
    /// Per-protocol buffer sizes: architecture default unless the config
    /// carries an explicit override for that protocol.
    pub fn compute(config: &CommConfig) -> Self {
        let mut profile = CommProfile::default();
        let overrides = [
            config.buffsize_ll,
            config.buffsize_ll128,
            config.buffsize_simple,
        ];
        for (slot, over) in profile.buff_sizes.iter_mut().zip(overrides) {
            if let Some(size) = over {
                *slot = size;
            }
        }
        profile
    }

    pub fn buff_size(&self, proto: Protocol) -> usize {
        self.buff_sizes[proto as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_independent() {
        let mut config = CommConfig::default();
        config.buffsize_ll128 = Some(1 << 16);
        let profile = CommProfile::compute(&config);
        assert_eq!(profile.buff_size(Protocol::Ll), DEFAULT_LL_BUFFSIZE);
        assert_eq!(profile.buff_size(Protocol::Ll128), 1 << 16);
        assert_eq!(profile.buff_size(Protocol::Simple), default_simple_buffsize());
    }
}
