use {
    crate::{
        session::SessionManager,
        store::{CreateMode, StoreError},
    },
    tracing::trace,
};

pub const READ_LOCK_PREFIX: &str = "read-";
pub const WRITE_LOCK_PREFIX: &str = "write-";

const SEQUENCE_DIGITS: usize = 10;

///
/// Joins path segments into a single absolute path.
///
/// Empty segments and `.` are dropped, `..` pops the previous segment and the result never has a trailing slash.
///
pub fn normalize_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in segments {
        for part in segment.as_ref().split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                part => parts.push(part),
            }
        }
    }
    format!("/{}", parts.join("/"))
}

///
/// Returns the parent of an absolute path, or `None` for the root.
///
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

///
/// Ancestor prefixes of `path`, root-most first, including `path` itself.
///
/// `/a/b/c` gives `/a`, `/a/b`, `/a/b/c`.
///
pub fn ancestor_paths(path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    (1..=parts.len())
        .map(|n| format!("/{}", parts[..n].join("/")))
        .collect()
}

///
/// Extracts the sequence number from a lock node name or path.
///
/// The name must end with `read-` or `write-` followed by exactly 10 digits, anything else yields `None`.
///
pub fn sequence_number(node: &str) -> Option<u64> {
    let split = node.len().checked_sub(SEQUENCE_DIGITS)?;
    // Names come from the store and may hold any UTF-8, so the split point need not be a char boundary.
    let (head, digits) = (node.get(..split)?, node.get(split..)?);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !(head.ends_with(READ_LOCK_PREFIX) || head.ends_with(WRITE_LOCK_PREFIX)) {
        return None;
    }
    digits.parse().ok()
}

///
/// True iff `own` has a sequence number and some child has a strictly smaller one.
///
/// Children with unparseable names are ignored.
///
pub fn does_lower_sequence_number_child_path_exist<S: AsRef<str>>(own: &str, children: &[S]) -> bool {
    let Some(own_seq) = sequence_number(own) else {
        return false;
    };
    children
        .iter()
        .filter_map(|child| sequence_number(child.as_ref()))
        .any(|seq| seq < own_seq)
}

///
/// The immediate predecessor of `own` among `children`: the child with the largest
/// sequence number strictly below `own`'s.
///
/// If `own` has no sequence number, no child qualifies.
///
pub fn get_next_lowest_sequence_number_child_path<'a, S: AsRef<str>>(
    own: &str,
    children: &'a [S],
) -> Option<&'a str> {
    let bound = sequence_number(own).unwrap_or(u64::MIN);
    children
        .iter()
        .map(AsRef::as_ref)
        .filter_map(|child| sequence_number(child).map(|seq| (seq, child)))
        .filter(|(seq, _)| *seq < bound)
        .max_by_key(|(seq, _)| *seq)
        .map(|(_, child)| child)
}

///
/// Path helpers that need the store.
///
#[derive(Clone)]
pub struct PathUtility {
    session: SessionManager,
}

impl PathUtility {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    ///
    /// Creates every missing ancestor of `path`, and `path` itself, as empty persistent nodes.
    ///
    /// "Node exists" is success for any segment, so concurrent callers racing on the same
    /// ancestors all succeed. Any other error stops the walk and is returned.
    ///
    pub async fn ensure_path_exists(&self, path: &str) -> Result<(), StoreError> {
        for ancestor in ancestor_paths(path) {
            let client = self.session.client();
            match client.create(&ancestor, Vec::new(), CreateMode::Persistent).await {
                Ok(_) => trace!("created {ancestor}"),
                Err(StoreError::NodeExists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{memory::MemoryStore, memory::Operation},
    };

    #[test]
    fn normalize_path_should_produce_canonical_absolute_paths() {
        assert_eq!(normalize_path(&["/resource/a"]), "/resource/a");
        assert_eq!(normalize_path(&["resource//a/"]), "/resource/a");
        assert_eq!(normalize_path(&["/resource", "write-"]), "/resource/write-");
        assert_eq!(normalize_path(&["/a/./b/../c"]), "/a/c");
        assert_eq!(normalize_path::<&str>(&[]), "/");
        assert_eq!(normalize_path(&["/"]), "/");
    }

    #[test]
    fn parent_and_ancestors() {
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(ancestor_paths("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert!(ancestor_paths("/").is_empty());
    }

    #[test]
    fn sequence_number_requires_known_prefix_and_ten_digits() {
        assert_eq!(sequence_number("read-0000000002"), Some(2));
        assert_eq!(sequence_number("/r/write-0000000017"), Some(17));
        assert_eq!(sequence_number("write-000000001"), None);
        assert_eq!(sequence_number("lease-0000000001"), None);
        assert_eq!(sequence_number("write-00000000x1"), None);
        assert_eq!(sequence_number("0000000001"), None);
    }

    #[test]
    fn sequence_number_should_ignore_non_ascii_names() {
        assert_eq!(sequence_number("aé123456789"), None);
        assert_eq!(sequence_number("é"), None);
        assert_eq!(sequence_number("wrïte-0000000001"), None);
        assert!(!does_lower_sequence_number_child_path_exist(
            "write-0000000005",
            &["aé123456789", "ü0000000001"]
        ));
        assert_eq!(
            get_next_lowest_sequence_number_child_path("write-0000000005", &["aé123456789", "read-0000000001"]),
            Some("read-0000000001")
        );
    }

    #[test]
    fn lower_sequence_number_child_detection() {
        assert!(does_lower_sequence_number_child_path_exist(
            "read-0000000002",
            &["write-0000000001"]
        ));
        assert!(!does_lower_sequence_number_child_path_exist(
            "read-0000000002",
            &["write-0000000003"]
        ));
        assert!(does_lower_sequence_number_child_path_exist(
            "read-0000000002",
            &["read-0000000001"]
        ));
        // Unparseable siblings never block.
        assert!(!does_lower_sequence_number_child_path_exist(
            "write-0000000002",
            &["garbage", "write-1"]
        ));
        // Unparseable own path is never blocked.
        assert!(!does_lower_sequence_number_child_path_exist(
            "write-",
            &["write-0000000001"]
        ));
    }

    #[test]
    fn next_lowest_is_the_immediate_predecessor() {
        let children = ["write-0000000001", "write-0000000003"];
        assert_eq!(
            get_next_lowest_sequence_number_child_path("write-0000000005", &children),
            Some("write-0000000003")
        );
        assert_eq!(
            get_next_lowest_sequence_number_child_path("write-0000000002", &children),
            Some("write-0000000001")
        );
        assert_eq!(
            get_next_lowest_sequence_number_child_path("write-0000000001", &children),
            None
        );
        let with_noise = ["read-0000000004", "junk", "write-0000000007"];
        assert_eq!(
            get_next_lowest_sequence_number_child_path("/r/write-0000000005", &with_noise),
            Some("read-0000000004")
        );
    }

    #[tokio::test]
    async fn ensure_path_exists_is_idempotent_under_concurrency() {
        let store = MemoryStore::new();
        let session = SessionManager::new(store.clone());
        assert!(session.connect().await);
        let utility = PathUtility::new(session);

        let u1 = utility.clone();
        let u2 = utility.clone();
        let (r1, r2) = tokio::join!(
            u1.ensure_path_exists("/a/b/c"),
            u2.ensure_path_exists("/a/b/c")
        );
        r1.expect("first");
        r2.expect("second");
        utility.ensure_path_exists("/a/b/c").await.expect("third");

        assert!(store.node_exists("/a"));
        assert!(store.node_exists("/a/b"));
        assert!(store.node_exists("/a/b/c"));
    }

    #[tokio::test]
    async fn ensure_path_exists_propagates_other_errors() {
        let store = MemoryStore::new();
        let session = SessionManager::new(store.clone());
        assert!(session.connect().await);
        let utility = PathUtility::new(session);

        store.fail_next(Operation::Create, StoreError::Injected("boom".into()));
        let result = utility.ensure_path_exists("/x/y").await;
        assert!(matches!(result, Err(StoreError::Injected(_))));
        assert!(!store.node_exists("/x"));
    }
}
