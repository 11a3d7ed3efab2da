use std::collections::HashMap;

/// Maps an IP address to its autonomous system number and organisation
pub trait AsnLookup: Send + Sync {
    fn lookup_asn(&self, ip: &str) -> Option<(u32, String)>;
}

/// Lookup that knows nothing; answers get ASN 0 and no organisation
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAsnLookup;

impl AsnLookup for NoAsnLookup {
    fn lookup_asn(&self, _ip: &str) -> Option<(u32, String)> {
        None
    }
}

/// In-memory table, typically seeded from a probe's geolocation results
#[derive(Debug, Clone, Default)]
pub struct StaticAsnLookup {
    entries: HashMap<String, (u32, String)>,
}

impl StaticAsnLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ip: &str, asn: u32, org: &str) {
        self.entries.insert(ip.to_string(), (asn, org.to_string()));
    }
}

impl AsnLookup for StaticAsnLookup {
    fn lookup_asn(&self, ip: &str) -> Option<(u32, String)> {
        self.entries.get(ip).cloned()
    }
}
