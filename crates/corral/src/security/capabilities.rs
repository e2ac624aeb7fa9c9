//! Dropping to the configured capability sets.

use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use corral_common::{Error, Result};

use crate::config::CapabilitySpec;

fn parse_set(names: &[String]) -> Result<CapsHashSet> {
    let mut set = CapsHashSet::new();
    for name in names {
        let cap = Capability::from_str(name).map_err(|_| Error::ConfigInvalid {
            reason: format!("unknown capability {name:?}"),
        })?;
        set.insert(cap);
    }
    Ok(set)
}

/// Reduce the current thread to the five configured sets.
///
/// The bounding set shrinks first (dropping needs CAP_SETPCAP, which may
/// itself be on the chopping block), then effective/permitted/inheritable,
/// then ambient, which the kernel only accepts after permitted and
/// inheritable agree.
pub fn apply_capabilities(spec: &CapabilitySpec) -> Result<()> {
    let bounding = parse_set(&spec.bounding)?;
    let effective = parse_set(&spec.effective)?;
    let permitted = parse_set(&spec.permitted)?;
    let inheritable = parse_set(&spec.inheritable)?;
    let ambient = parse_set(&spec.ambient)?;

    let internal = |e: caps::errors::CapsError| Error::Internal {
        message: format!("capability transition: {e}"),
    };

    for cap in caps::read(None, CapSet::Bounding).map_err(internal)? {
        if !bounding.contains(&cap) {
            caps::drop(None, CapSet::Bounding, cap).map_err(internal)?;
        }
    }

    caps::set(None, CapSet::Inheritable, &inheritable).map_err(internal)?;
    caps::set(None, CapSet::Permitted, &permitted).map_err(internal)?;
    caps::set(None, CapSet::Effective, &effective).map_err(internal)?;
    caps::set(None, CapSet::Ambient, &ambient).map_err(internal)?;

    tracing::debug!(
        bounding = bounding.len(),
        effective = effective.len(),
        ambient = ambient.len(),
        "Capability sets applied"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_capability_names() {
        let set = parse_set(&[
            "CAP_CHOWN".to_string(),
            "CAP_NET_BIND_SERVICE".to_string(),
            "CAP_SYS_ADMIN".to_string(),
        ])
        .unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&Capability::CAP_CHOWN));
    }

    #[test]
    fn unknown_capability_is_config_error() {
        let err = parse_set(&["CAP_FLY".to_string()]).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }
}
