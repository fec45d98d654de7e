/// Type representing a commit object.
macro_rules! gv_commit {
    () => {
        gvariant::gv!("(a{sv}aya(say)sstayay)")
    };
}
pub(crate) use gv_commit;

/// Type representing a DIRTREE object.
macro_rules! gv_dirtree {
    () => {
        gvariant::gv!("(a(say)a(sayay))")
    };
}
pub(crate) use gv_dirtree;

/// Type representing a DIRMETA object.
macro_rules! gv_dirmeta {
    () => {
        gvariant::gv!("(a{sv}uuua(ayay))")
    };
}
pub(crate) use gv_dirmeta;

/// Type representing the attribute header of a content object.
macro_rules! gv_filehdr {
    () => {
        gvariant::gv!("(tuuusa(ayay))")
    };
}
pub(crate) use gv_filehdr;

#[cfg(test)]
mod tests {
    use gvariant::aligned_bytes::TryAsAligned;
    use gvariant::Marker;

    use super::*;
    #[test]
    fn test_markers() {
        // Just a compilation test. Each macro's GVariant type has its own
        // required alignment, so each needs its own `try_as_aligned` call.
        if let Some(data) = b"".try_as_aligned().ok() {
            let _t = gv_dirtree!().cast(data);
        }
        if let Some(data) = b"".try_as_aligned().ok() {
            let _t = gv_dirmeta!().cast(data);
        }
        if let Some(data) = b"".try_as_aligned().ok() {
            let _t = gv_filehdr!().cast(data);
        }
        if let Some(data) = b"".try_as_aligned().ok() {
            let _t = gv_commit!().cast(data);
        }
    }
}
