#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Sled,
    Memory,
}

impl StorageEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sled" => Some(Self::Sled),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sled => "sled",
            Self::Memory => "memory",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low_space" => Some(Self::LowSpace),
            "high_throughput" => Some(Self::HighThroughput),
            _ => None,
        }
    }

    pub(crate) fn into_sled(self) -> sled::Mode {
        match self {
            Self::LowSpace => sled::Mode::LowSpace,
            Self::HighThroughput => sled::Mode::HighThroughput,
        }
    }
}
