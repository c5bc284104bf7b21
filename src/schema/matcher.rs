use wildmatch::WildMatch;

/// 集合名匹配（`--only` 选择用）
pub trait CollectionMatcher: Send + Sync {
    fn matches(&self, name: &str) -> bool;
}

/// 精确匹配
pub struct ExactMatcher {
    name: String,
}

impl ExactMatcher {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl CollectionMatcher for ExactMatcher {
    fn matches(&self, name: &str) -> bool {
        self.name == name
    }
}

/// 通配符匹配 (Glob)
pub struct GlobMatcher {
    wild: WildMatch,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Self {
        Self {
            wild: WildMatch::new(pattern),
        }
    }
}

impl CollectionMatcher for GlobMatcher {
    fn matches(&self, name: &str) -> bool {
        self.wild.matches(name)
    }
}

/// 逗号分隔的多个模式，任一命中即可
pub struct AnyMatcher {
    inner: Vec<Box<dyn CollectionMatcher>>,
}

impl CollectionMatcher for AnyMatcher {
    fn matches(&self, name: &str) -> bool {
        self.inner.iter().any(|m| m.matches(name))
    }
}

fn single(pattern: &str) -> Box<dyn CollectionMatcher> {
    if pattern.contains('*') || pattern.contains('?') {
        Box::new(GlobMatcher::new(pattern))
    } else {
        Box::new(ExactMatcher::new(pattern))
    }
}

/// 匹配器工厂：`tracks`、`track*`、`sites,fleets` 都可以
pub fn create_matcher(pattern: &str) -> Box<dyn CollectionMatcher> {
    let parts: Vec<&str> = pattern
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [one] => single(one),
        many => Box::new(AnyMatcher {
            inner: many.iter().map(|p| single(p)).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_glob_and_lists() {
        assert!(create_matcher("tracks").matches("tracks"));
        assert!(!create_matcher("tracks").matches("filtertracks"));
        assert!(create_matcher("*tracks").matches("filtertracks"));
        assert!(create_matcher("mark?rs").matches("markers"));

        let m = create_matcher("sites, fleets");
        assert!(m.matches("sites") && m.matches("fleets"));
        assert!(!m.matches("vessels"));
    }
}
