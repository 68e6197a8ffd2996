//! The search path: bloom pre-filter, then tree descent.
//!
//! All three entrypoints (NMDC, ADC, direct) share the same descent
//! shape. Terms matched by a directory name are dropped from the term
//! list handed to that subtree, so descendants only need to satisfy
//! what the path has not already satisfied.

use std::sync::atomic::Ordering;

use skiff_types::{AdcQuery, Cid, DirectSearchResult, FileType, NmdcQuery, SizeMode, StringSearch, Tth};

use crate::index::ShareIndex;
use crate::profiles::{ProfileId, PROFILE_DEFAULT};
use crate::state::{is_strict_sub, ShareState};
use crate::tree::DirRef;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    File,
    Directory,
}

/// One search hit, with the NMDC-style display path.
#[derive(Debug, Clone)]
pub struct SearchResultItem {
    pub kind: ResultKind,
    pub path: String,
    pub size: i64,
    pub tth: Option<Tth>,
}

/// Drop terms the directory name satisfies; `None` when nothing
/// matched and the caller's list stays in effect.
fn prune_terms(terms: &[StringSearch], dir_name: &str) -> Option<Vec<StringSearch>> {
    if terms.iter().any(|t| t.matches(dir_name)) {
        Some(
            terms
                .iter()
                .filter(|t| !t.matches(dir_name))
                .cloned()
                .collect(),
        )
    } else {
        None
    }
}

/// Roots to start a descent from: registered for the profile, and not
/// covered by an ancestor root that the descent would already visit.
pub(crate) fn descent_roots(state: &ShareState, profile: ProfileId) -> Vec<DirRef> {
    state
        .roots
        .iter()
        .filter(|(path, _)| {
            let visible = state
                .profile_dirs
                .get(path.as_str())
                .is_some_and(|pd| pd.has_profile(profile));
            visible
                && !state.roots.keys().any(|other| {
                    is_strict_sub(other, path)
                        && state
                            .profile_dirs
                            .get(other)
                            .is_some_and(|pd| pd.has_profile(profile))
                })
        })
        .map(|(_, dref)| *dref)
        .collect()
}

impl ShareIndex {
    /// NMDC search over the default profile.
    pub fn search_nmdc(&self, query: &NmdcQuery, max_results: usize) -> Vec<SearchResultItem> {
        let mut results = Vec::new();
        let state = self.state.read().unwrap();

        if query.file_type == FileType::Tth {
            let Some(token) = query.tokens.first() else {
                return results;
            };
            let Some(encoded) = token.strip_prefix("tth:") else {
                return results;
            };
            if let Ok(tth) = Tth::from_base32(&encoded.to_uppercase()) {
                if let Some(fref) = state.tth_index.get(&tth).and_then(|refs| refs.first()) {
                    if state.is_visible(fref.dir_ref(), PROFILE_DEFAULT) {
                        let file = state.file(*fref);
                        results.push(SearchResultItem {
                            kind: ResultKind::File,
                            path: format!(
                                "{}{}",
                                state.full_name(fref.dir_ref(), PROFILE_DEFAULT),
                                file.name
                            ),
                            size: file.size,
                            tth: Some(file.tth),
                        });
                    }
                }
            }
            return results;
        }

        self.searches.fetch_add(1, Ordering::Relaxed);
        if !state
            .bloom
            .match_terms(query.tokens.iter().map(String::as_str))
        {
            self.stopped_searches.fetch_add(1, Ordering::Relaxed);
            return results;
        }

        let terms: Vec<StringSearch> = query
            .tokens
            .iter()
            .map(|t| StringSearch::new(t))
            .collect();
        if terms.is_empty() {
            return results;
        }

        for root in descent_roots(&state, PROFILE_DEFAULT) {
            if results.len() >= max_results {
                break;
            }
            nmdc_descent(&state, root, &terms, query, max_results, &mut results);
        }
        results
    }

    /// ADC search for one profile. `user_cid` unlocks that user's
    /// temp shares on hash lookups.
    pub fn search_adc(
        &self,
        query: &AdcQuery,
        profile: ProfileId,
        max_results: usize,
        user_cid: Option<&Cid>,
    ) -> Vec<SearchResultItem> {
        let mut results = Vec::new();
        let state = self.state.read().unwrap();

        if let Some(root) = &query.root {
            if let Some(fref) = state.tth_index.get(root).and_then(|refs| refs.first()) {
                if state.is_visible(fref.dir_ref(), profile) {
                    let file = state.file(*fref);
                    results.push(SearchResultItem {
                        kind: ResultKind::File,
                        path: format!(
                            "{}{}",
                            state.full_name(fref.dir_ref(), profile),
                            file.name
                        ),
                        size: file.size,
                        tth: Some(file.tth),
                    });
                    return results;
                }
            }

            // Ad-hoc shares are reachable by hash only.
            let temp = self.temp.lock().unwrap();
            for info in temp.find_all(root, user_cid) {
                let name = info.path.rsplit(['/', '\\']).next().unwrap_or("").to_string();
                results.push(SearchResultItem {
                    kind: ResultKind::File,
                    path: format!("tmp\\{name}"),
                    size: info.size,
                    tth: Some(*root),
                });
            }
            return results;
        }

        self.searches.fetch_add(1, Ordering::Relaxed);
        for term in &query.include {
            if !state.bloom.contains(term.pattern()) {
                self.stopped_searches.fetch_add(1, Ordering::Relaxed);
                return results;
            }
        }

        for root in descent_roots(&state, profile) {
            if results.len() >= max_results {
                break;
            }
            adc_descent(
                &state,
                root,
                query,
                &query.include,
                profile,
                max_results,
                &mut results,
            );
        }
        results
    }

    /// Direct search: returns directory paths of matches, not files.
    pub fn direct_search(
        &self,
        query: &AdcQuery,
        profile: ProfileId,
        max_results: usize,
        directory: &str,
    ) -> Result<Vec<DirectSearchResult>> {
        let mut results = Vec::new();
        let state = self.state.read().unwrap();

        if let Some(root) = &query.root {
            if let Some(refs) = state.tth_index.get(root) {
                for fref in refs {
                    if state.is_visible(fref.dir_ref(), profile) {
                        results.push(DirectSearchResult {
                            path: state.adc_path(fref.dir_ref(), profile),
                        });
                    }
                }
            }
            return Ok(results);
        }

        for term in &query.include {
            if !state.bloom.contains(term.pattern()) {
                return Ok(results);
            }
        }

        if directory.is_empty() || directory == "/" {
            for root in descent_roots(&state, profile) {
                if results.len() >= max_results {
                    break;
                }
                direct_descent(&state, root, query, profile, max_results, &mut results);
            }
        } else {
            let dirs = state.find_virtuals(directory, profile)?;
            for dref in dirs {
                if state.is_level_excluded(dref, profile) {
                    continue;
                }
                direct_descent(&state, dref, query, profile, max_results, &mut results);
            }
        }
        Ok(results)
    }

    /// Observed bloom effectiveness.
    pub fn bloom_stats(&self) -> String {
        let total = self.searches.load(Ordering::Relaxed);
        let stopped = self.stopped_searches.load(Ordering::Relaxed);
        let percent = if total > 0 {
            (stopped as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        format!("Total searches: {total}, stopped by the filter: {percent:.1}% ({stopped} searches)")
    }
}

fn nmdc_descent(
    state: &ShareState,
    dref: DirRef,
    terms: &[StringSearch],
    query: &NmdcQuery,
    max_results: usize,
    results: &mut Vec<SearchResultItem>,
) {
    let node = state.dir(dref);
    // Nothing of the wanted type anywhere below.
    if !node.has_type(query.file_type) {
        return;
    }

    let dir_name = state.virtual_name(dref, PROFILE_DEFAULT);
    let pruned = prune_terms(terms, &dir_name);
    let cur = pruned.as_deref().unwrap_or(terms);

    // NMDC directory results carry no size, so a size restriction
    // rules them out.
    let size_ok = query.size_mode != SizeMode::AtLeast || query.size == 0;
    if cur.is_empty()
        && ((query.file_type == FileType::Any && size_ok)
            || query.file_type == FileType::Directory)
    {
        results.push(SearchResultItem {
            kind: ResultKind::Directory,
            path: state.full_name(dref, PROFILE_DEFAULT),
            size: 0,
            tth: None,
        });
    }

    if query.file_type != FileType::Directory {
        for file in &node.files {
            if !query.size_ok(file.size) {
                continue;
            }
            if !cur.iter().all(|t| t.matches(&file.name)) {
                continue;
            }
            if query.file_type.matches(&file.name) {
                results.push(SearchResultItem {
                    kind: ResultKind::File,
                    path: format!("{}{}", state.full_name(dref, PROFILE_DEFAULT), file.name),
                    size: file.size,
                    tth: Some(file.tth),
                });
                if results.len() >= max_results {
                    break;
                }
            }
        }
    }

    for child in node.children.values() {
        if results.len() >= max_results {
            break;
        }
        let cref = DirRef {
            root: dref.root,
            dir: *child,
        };
        if state.is_level_excluded(cref, PROFILE_DEFAULT) {
            continue;
        }
        nmdc_descent(state, cref, cur, query, max_results, results);
    }
}

fn adc_descent(
    state: &ShareState,
    dref: DirRef,
    query: &AdcQuery,
    include: &[StringSearch],
    profile: ProfileId,
    max_results: usize,
    results: &mut Vec<SearchResultItem>,
) {
    let node = state.dir(dref);
    let dir_name = state.virtual_name(dref, profile);

    let pruned = if !query.is_excluded(&dir_name) {
        prune_terms(include, &dir_name)
    } else {
        None
    };
    let cur = pruned.as_deref().unwrap_or(include);

    if cur.is_empty() && query.ext.is_empty() && query.gt == 0 {
        results.push(SearchResultItem {
            kind: ResultKind::Directory,
            path: state.full_name(dref, profile),
            size: state.profile_size(dref, profile),
            tth: None,
        });
    }

    if !query.is_directory {
        for file in &node.files {
            if file.size < query.gt || file.size > query.lt {
                continue;
            }
            if query.is_excluded(&file.name) {
                continue;
            }
            if !cur.iter().all(|t| t.matches(&file.name)) {
                continue;
            }
            if query.has_ext(&file.name) {
                results.push(SearchResultItem {
                    kind: ResultKind::File,
                    path: format!("{}{}", state.full_name(dref, profile), file.name),
                    size: file.size,
                    tth: Some(file.tth),
                });
                if results.len() >= max_results {
                    return;
                }
            }
        }
    }

    for child in node.children.values() {
        if results.len() >= max_results {
            break;
        }
        let cref = DirRef {
            root: dref.root,
            dir: *child,
        };
        if state.is_level_excluded(cref, profile) {
            continue;
        }
        adc_descent(state, cref, query, cur, profile, max_results, results);
    }
}

fn direct_descent(
    state: &ShareState,
    dref: DirRef,
    query: &AdcQuery,
    profile: ProfileId,
    max_results: usize,
    results: &mut Vec<DirectSearchResult>,
) {
    let node = state.dir(dref);
    let dir_name = state.virtual_name(dref, profile);

    if query.matches_direct_directory_name(&dir_name) {
        let parent_path = match node.parent {
            Some(parent) => state.adc_path(
                DirRef {
                    root: dref.root,
                    dir: parent,
                },
                profile,
            ),
            None => "/".to_string(),
        };
        if !results.iter().any(|r| r.path == parent_path)
            && query.matches_size(state.profile_size(dref, profile))
        {
            results.push(DirectSearchResult { path: parent_path });
        }
    }

    if !query.is_directory {
        for file in &node.files {
            if query.matches_direct_file(&file.name, file.size) {
                results.push(DirectSearchResult {
                    path: state.adc_path(dref, profile),
                });
                break;
            }
        }
    }

    for child in node.children.values() {
        if results.len() >= max_results {
            break;
        }
        let cref = DirRef {
            root: dref.root,
            dir: *child,
        };
        if state.is_level_excluded(cref, profile) {
            continue;
        }
        direct_descent(state, cref, query, profile, max_results, results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_terms() {
        let terms = vec![StringSearch::new("song"), StringSearch::new("mp3")];
        let pruned = prune_terms(&terms, "my songs").unwrap();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].pattern(), "mp3");

        assert!(prune_terms(&terms, "unrelated").is_none());
    }
}
