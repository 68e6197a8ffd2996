//! End-to-end share tests over a synthetic disk: profile descriptor
//! load, blocking scan, hash/name/search queries and catalog
//! generation.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use skiff_config::Settings;
use skiff_share::scanner::DirEntryInfo;
use skiff_share::{
    DirectoryLister, ProfileId, ResultKind, ShareIndex, PROFILE_DEFAULT,
};
use skiff_types::{
    AdcQuery, BundleId, BundleSpec, Cid, FileType, HashProvider, MatchResult, NmdcQuery, Priority,
    QueueBridge, QueueError, RemoteUser, ShareLookup, SizeMode, Tth,
};

#[derive(Default)]
struct FakeDisk {
    dirs: HashMap<String, Vec<DirEntryInfo>>,
}

impl FakeDisk {
    fn dir(&mut self, path: &str) -> &mut Vec<DirEntryInfo> {
        self.dirs.entry(path.to_string()).or_default()
    }

    fn add_dir(&mut self, parent: &str, name: &str) {
        self.dir(parent).push(DirEntryInfo {
            name: name.to_string(),
            is_dir: true,
            hidden: false,
            size: 0,
            last_write: 40,
        });
        self.dir(&format!("{parent}{name}/"));
    }

    fn add_file(&mut self, parent: &str, name: &str, size: i64) {
        self.dir(parent).push(DirEntryInfo {
            name: name.to_string(),
            is_dir: false,
            hidden: false,
            size,
            last_write: 50,
        });
    }
}

impl DirectoryLister for FakeDisk {
    fn list(&self, path: &str) -> io::Result<Vec<DirEntryInfo>> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn dir_info(&self, path: &str) -> Option<DirEntryInfo> {
        Some(DirEntryInfo {
            name: path.trim_end_matches('/').rsplit('/').next()?.to_string(),
            is_dir: true,
            hidden: false,
            size: 0,
            last_write: 40,
        })
    }

    fn exists(&self, path: &str) -> bool {
        if self.dirs.contains_key(path) {
            return true;
        }
        match path.rfind('/') {
            Some(pos) => self
                .dirs
                .get(&path[..pos + 1])
                .is_some_and(|entries| entries.iter().any(|e| e.name == path[pos + 1..])),
            None => false,
        }
    }
}

#[derive(Default)]
struct FakeHasher {
    hashes: HashMap<String, Tth>,
}

impl HashProvider for FakeHasher {
    fn tth(&self, path: &Path, _size: i64, _mtime: u32) -> Option<Tth> {
        self.hashes.get(path.to_str()?).copied()
    }

    fn tth_for_cached(&self, path: &Path, _size: i64) -> Option<Tth> {
        self.hashes.get(path.to_str()?).copied()
    }

    fn leaves(&self, _tth: &Tth) -> Option<Vec<u8>> {
        None
    }
}

struct NullQueue;

impl QueueBridge for NullQueue {
    fn forbidden_paths(&self, _roots: &[String]) -> Vec<String> {
        Vec::new()
    }
    fn is_queued(&self, _tth: &Tth) -> bool {
        false
    }
    fn create_bundle(&self, _spec: BundleSpec) -> BundleId {
        BundleId(0)
    }
    fn add_file(
        &self,
        _bundle: BundleId,
        _target: &str,
        _size: i64,
        _tth: &Tth,
        _user: &RemoteUser,
    ) -> Result<(), QueueError> {
        Ok(())
    }
    fn submit_bundle(&self, _bundle: BundleId) {}
    fn add_directory_download(
        &self,
        _dir: &str,
        _user: &RemoteUser,
        _target: &str,
        _priority: Priority,
        _retry: bool,
    ) {
    }
    fn request_partial_list(&self, _user: &RemoteUser, _dir: &str) {}
    fn match_listing(&self, _user: &RemoteUser, _files: &[(String, i64, Tth)]) -> MatchResult {
        MatchResult::default()
    }
}

const T1: Tth = Tth([1; 24]);
const T2: Tth = Tth([2; 24]);
const T3: Tth = Tth([3; 24]);

fn settings() -> Settings {
    Settings {
        config_dir: std::env::temp_dir(),
        no_zero_byte: true,
        ..Settings::default()
    }
}

fn music_share() -> Arc<ShareIndex> {
    let mut disk = FakeDisk::default();
    disk.dir("/home/a/");
    disk.add_dir("/home/a/", "albums");
    disk.add_file("/home/a/albums/", "my_song.mp3", 10);
    disk.add_file("/home/a/albums/", "my_song.txt", 10);
    disk.add_file("/home/a/albums/", "song.flac", 20);
    disk.add_file("/home/a/", "y.txt", 0);

    let mut hasher = FakeHasher::default();
    hasher.hashes.insert("/home/a/albums/my_song.mp3".into(), T1);
    hasher.hashes.insert("/home/a/albums/my_song.txt".into(), T2);
    hasher.hashes.insert("/home/a/albums/song.flac".into(), T3);

    let index = ShareIndex::with_lister(
        settings(),
        Cid([7; 24]),
        Arc::new(hasher),
        Arc::new(NullQueue),
        Arc::new(disk),
    );
    index
        .load_profiles(
            r#"<Shares><Share Token="0" Name="Default">
                <Directory Virtual="a">/home/a/</Directory>
            </Share></Shares>"#,
        )
        .unwrap();
    index.refresh_startup();
    index
}

#[test]
fn test_scan_totals_and_zero_byte_policy() {
    let index = music_share();
    // y.txt is excluded by the zero-byte policy.
    assert_eq!(index.total_share_size(PROFILE_DEFAULT), 40);
    assert!(index.is_tth_shared(&T1));
    let (size, files) = index.profile_share_info(PROFILE_DEFAULT);
    assert_eq!(size, 40);
    assert_eq!(files, 3);
}

#[test]
fn test_unhashed_files_stay_out() {
    let mut disk = FakeDisk::default();
    disk.dir("/home/a/");
    disk.add_file("/home/a/", "hashed.bin", 5);
    disk.add_file("/home/a/", "pending.bin", 7);

    let mut hasher = FakeHasher::default();
    hasher.hashes.insert("/home/a/hashed.bin".into(), T1);

    let index = ShareIndex::with_lister(
        settings(),
        Cid([7; 24]),
        Arc::new(hasher),
        Arc::new(NullQueue),
        Arc::new(disk),
    );
    index
        .load_profiles(
            r#"<Shares><Share Token="0" Name="Default">
                <Directory Virtual="a">/home/a/</Directory>
            </Share></Shares>"#,
        )
        .unwrap();
    index.refresh_startup();

    assert_eq!(index.total_share_size(PROFILE_DEFAULT), 5);
}

#[test]
fn test_nmdc_search_with_type_filter() {
    let index = music_share();

    let query = NmdcQuery::parse("song$mp3", SizeMode::AtLeast, 0, FileType::Audio);
    let results = index.search_nmdc(&query, 10);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, ResultKind::File);
    assert!(results[0].path.ends_with("my_song.mp3"));
    assert_eq!(results[0].tth, Some(T1));

    // .flac is an audio long extension.
    let query = NmdcQuery::parse("song$flac", SizeMode::Any, 0, FileType::Audio);
    let results = index.search_nmdc(&query, 10);
    assert_eq!(results.len(), 1);
    assert!(results[0].path.ends_with("song.flac"));

    // The text file never classifies as audio.
    let query = NmdcQuery::parse("my_song$txt", SizeMode::Any, 0, FileType::Audio);
    assert!(index.search_nmdc(&query, 10).is_empty());
}

#[test]
fn test_directory_name_prunes_tokens() {
    // "albums" is satisfied by the path, "song" by the file name.
    let index = music_share();
    let query = NmdcQuery::parse("albums$song$mp3", SizeMode::Any, 0, FileType::Audio);
    let results = index.search_nmdc(&query, 10);
    assert_eq!(results.len(), 1);
}

#[test]
fn test_bloom_stops_absent_terms() {
    let index = music_share();
    let query = AdcQuery::parse("song zz9qq", &[]);
    assert!(index.search_adc(&query, PROFILE_DEFAULT, 10, None).is_empty());
}

#[test]
fn test_adc_root_lookup() {
    let index = music_share();
    let query = AdcQuery::with_root(T3);
    let results = index.search_adc(&query, PROFILE_DEFAULT, 10, None);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].size, 20);
}

#[test]
fn test_direct_search_returns_directory_paths() {
    let index = music_share();
    let query = AdcQuery::parse("song", &[]);
    let results = index.direct_search(&query, PROFILE_DEFAULT, 10, "/").unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "/a/albums/");
}

#[test]
fn test_virtual_path_resolution() {
    let index = music_share();
    let paths = index.real_paths("/a/albums/", PROFILE_DEFAULT).unwrap();
    assert_eq!(paths, vec!["/home/a/albums/".to_string()]);

    let paths = index
        .real_paths("/a/albums/my_song.mp3", PROFILE_DEFAULT)
        .unwrap();
    assert_eq!(paths, vec!["/home/a/albums/my_song.mp3".to_string()]);

    assert!(index.real_paths("/missing/x/", PROFILE_DEFAULT).is_err());
}

#[test]
fn test_to_real_with_size_by_hash() {
    let index = music_share();
    let profiles = [PROFILE_DEFAULT].into_iter().collect();
    let (path, size) = index
        .to_real_with_size(&format!("TTH/{}", T1.to_base32()), &profiles, None)
        .unwrap();
    assert_eq!(path, "/home/a/albums/my_song.mp3");
    assert_eq!(size, 10);

    assert!(index
        .to_real_with_size("MyList.DcLst", &profiles, None)
        .is_err());
}

#[test]
fn test_temp_share_fallback() {
    let index = music_share();
    let user = Cid([9; 24]);
    let tth = Tth([0xCC; 24]);
    assert!(index.add_temp_share(&user.to_base32(), tth, "/tmp/extra.bin", 77, true));

    let profiles = [PROFILE_DEFAULT].into_iter().collect();
    let virtual_file = format!("TTH/{}", tth.to_base32());
    let (path, size) = index
        .to_real_with_size(&virtual_file, &profiles, Some(&user))
        .unwrap();
    assert_eq!(path, "/tmp/extra.bin");
    assert_eq!(size, 77);

    // Another user cannot see the keyed entry.
    assert!(index
        .to_real_with_size(&virtual_file, &profiles, Some(&Cid([8; 24])))
        .is_err());

    index.remove_temp_share(&user.to_base32(), &tth);
    assert!(index
        .to_real_with_size(&virtual_file, &profiles, Some(&user))
        .is_err());
}

fn release_share() -> Arc<ShareIndex> {
    let mut disk = FakeDisk::default();
    disk.dir("/srv/rips/");
    disk.add_dir("/srv/rips/", "my.album");
    disk.add_dir("/srv/rips/my.album/", "cd1");
    disk.add_file("/srv/rips/my.album/cd1/", "track.mp3", 30);
    disk.add_dir("/srv/rips/", "other");
    disk.add_dir("/srv/rips/other/", "cd1");

    let mut hasher = FakeHasher::default();
    hasher
        .hashes
        .insert("/srv/rips/my.album/cd1/track.mp3".into(), T1);

    let index = ShareIndex::with_lister(
        settings(),
        Cid([7; 24]),
        Arc::new(hasher),
        Arc::new(NullQueue),
        Arc::new(disk),
    );
    index
        .load_profiles(
            r#"<Shares><Share Token="0" Name="Default">
                <Directory Virtual="rips">/srv/rips/</Directory>
            </Share></Shares>"#,
        )
        .unwrap();
    index.refresh_startup();
    index
}

#[test]
fn test_dir_by_name_walks_subdir_stacks() {
    let index = release_share();

    // The CD1 bucket is ambiguous; the ancestry disambiguates.
    let dref = index.dir_by_name("my.album\\cd1\\").unwrap();
    let path = {
        // Resolve through the public lookup.
        index.dir_real_path("my.album\\cd1\\").unwrap()
    };
    let _ = dref;
    assert_eq!(path, "/srv/rips/my.album/cd1/");

    assert!(index.dir_by_name("unknown.album\\cd1\\").is_none());
    // A plain name resolves without ancestry.
    assert!(index.dir_by_name("my.album\\").is_some());
}

#[test]
fn test_dir_share_state_compares_sizes() {
    use skiff_types::DirShareState;
    let index = release_share();
    assert_eq!(
        index.dir_share_state("my.album\\cd1\\", 30),
        DirShareState::Full
    );
    assert_eq!(
        index.dir_share_state("my.album\\cd1\\", 31),
        DirShareState::Partial
    );
    assert_eq!(
        index.dir_share_state("nothing.here\\", 1),
        DirShareState::None
    );
}

#[test]
fn test_is_file_shared_requires_matching_name() {
    let index = music_share();
    assert!(index.is_file_shared(&T1, "my_song.mp3"));
    assert!(index.is_file_shared(&T1, "MY_SONG.MP3"));
    assert!(!index.is_file_shared(&T1, "renamed.mp3"));
}

#[test]
fn test_partial_list_marks_incomplete() {
    let index = music_share();
    let xml = index
        .generate_partial_list("/a/", false, PROFILE_DEFAULT)
        .unwrap();
    assert!(xml.contains(r#"Base="/a/""#));
    assert!(xml.contains("BaseDate="));
    assert!(xml.contains(r#"Incomplete="1""#));
    assert!(xml.contains(r#"Size="40""#));
    // Children only; the file below albums is not listed.
    assert!(!xml.contains("my_song.mp3"));
}

#[test]
fn test_partial_list_of_unknown_base_fails() {
    let index = music_share();
    assert!(index
        .generate_partial_list("/nope/", false, PROFILE_DEFAULT)
        .is_err());
    assert!(index
        .generate_partial_list("no-slashes", false, PROFILE_DEFAULT)
        .is_err());
}

#[test]
fn test_tth_list_generation() {
    let index = music_share();
    let list = index
        .generate_tth_list("/a/albums/", true, PROFILE_DEFAULT)
        .unwrap();
    assert!(list.contains(&T1.to_base32()));
    assert!(list.contains(&T3.to_base32()));
}

#[test]
fn test_excluded_profile_directory_is_invisible() {
    let mut disk = FakeDisk::default();
    disk.dir("/home/a/");
    disk.add_dir("/home/a/", "public");
    disk.add_file("/home/a/public/", "pub.bin", 5);
    disk.add_dir("/home/a/", "private");
    disk.add_file("/home/a/private/", "priv.bin", 7);

    let mut hasher = FakeHasher::default();
    hasher.hashes.insert("/home/a/public/pub.bin".into(), T1);
    hasher.hashes.insert("/home/a/private/priv.bin".into(), T2);

    let index = ShareIndex::with_lister(
        settings(),
        Cid([7; 24]),
        Arc::new(hasher),
        Arc::new(NullQueue),
        Arc::new(disk),
    );
    index
        .load_profiles(
            r#"<Shares><Share Token="0" Name="Default">
                <Directory Virtual="a">/home/a/</Directory>
                <NoShare><Directory>/home/a/private/</Directory></NoShare>
            </Share></Shares>"#,
        )
        .unwrap();
    index.refresh_startup();

    // The excluded subtree is skipped for the default profile.
    assert_eq!(index.total_share_size(PROFILE_DEFAULT), 5);
    assert!(index
        .real_paths("/a/private/", PROFILE_DEFAULT)
        .is_err());

    let query = NmdcQuery::parse("priv", SizeMode::Any, 0, FileType::Any);
    assert!(index.search_nmdc(&query, 10).is_empty());
}

#[test]
fn test_cache_round_trip() {
    let tmp = tempfile::tempdir().unwrap();

    // Build, scan and persist.
    {
        let mut disk = FakeDisk::default();
        disk.dir("/home/a/");
        disk.add_dir("/home/a/", "albums");
        disk.add_file("/home/a/albums/", "my_song.mp3", 10);
        let mut hasher = FakeHasher::default();
        hasher.hashes.insert("/home/a/albums/my_song.mp3".into(), T1);

        let index = ShareIndex::with_lister(
            Settings {
                config_dir: tmp.path().to_path_buf(),
                ..Settings::default()
            },
            Cid([7; 24]),
            Arc::new(hasher),
            Arc::new(NullQueue),
            Arc::new(disk),
        );
        index
            .load_profiles(
                r#"<Shares><Share Token="0" Name="Default">
                    <Directory Virtual="a">/home/a/</Directory>
                </Share></Shares>"#,
            )
            .unwrap();
        index.refresh_startup();
        index.save_cache().unwrap();
    }

    // A fresh instance rebuilds from the cache without any disk walk:
    // the lister knows nothing, the hashes come from the hash manager
    // by (path, size).
    let mut hasher = FakeHasher::default();
    hasher.hashes.insert("/home/a/albums/my_song.mp3".into(), T1);
    let index = ShareIndex::with_lister(
        Settings {
            config_dir: tmp.path().to_path_buf(),
            ..Settings::default()
        },
        Cid([7; 24]),
        Arc::new(hasher),
        Arc::new(NullQueue),
        Arc::new(FakeDisk::default()),
    );
    index
        .load_profiles(
            r#"<Shares><Share Token="0" Name="Default">
                <Directory Virtual="a">/home/a/</Directory>
            </Share></Shares>"#,
        )
        .unwrap();
    assert!(index.load_cache().unwrap());

    assert_eq!(index.total_share_size(PROFILE_DEFAULT), 10);
    assert!(index.is_tth_shared(&T1));
    assert!(index.dir_by_name("albums\\").is_some());
}

#[test]
fn test_compressed_file_list_generation() {
    use std::io::Read as _;

    let tmp = tempfile::tempdir().unwrap();
    let mut disk = FakeDisk::default();
    disk.dir("/home/a/");
    disk.add_file("/home/a/", "x.bin", 5);
    let mut hasher = FakeHasher::default();
    hasher.hashes.insert("/home/a/x.bin".into(), T1);

    let index = ShareIndex::with_lister(
        Settings {
            config_dir: tmp.path().to_path_buf(),
            ..Settings::default()
        },
        Cid([7; 24]),
        Arc::new(hasher),
        Arc::new(NullQueue),
        Arc::new(disk),
    );
    index
        .load_profiles(
            r#"<Shares><Share Token="0" Name="Default">
                <Directory Virtual="a">/home/a/</Directory>
            </Share></Shares>"#,
        )
        .unwrap();
    index.refresh_startup();

    let path = index.generate_file_list(PROFILE_DEFAULT, false).unwrap();
    assert!(path.to_string_lossy().ends_with(".xml.bz2"));

    let mut xml = String::new();
    bzip2::read::BzDecoder::new(std::fs::File::open(&path).unwrap())
        .read_to_string(&mut xml)
        .unwrap();
    assert!(xml.contains(r#"<FileListing Version="1""#));
    assert!(xml.contains("x.bin"));
    assert!(xml.contains(&T1.to_base32()));

    // Unchanged share: the cached list is reused.
    let again = index.generate_file_list(PROFILE_DEFAULT, false).unwrap();
    assert_eq!(path, again);

    // Forcing bumps the generation.
    let forced = index.generate_own_list(PROFILE_DEFAULT).unwrap();
    assert_ne!(path, forced);
}

#[test]
fn test_refresh_with_no_roots_reports_path_not_found() {
    let index = ShareIndex::with_lister(
        settings(),
        Cid([7; 24]),
        Arc::new(FakeHasher::default()),
        Arc::new(NullQueue),
        Arc::new(FakeDisk::default()),
    );
    assert_eq!(
        index.refresh_startup(),
        skiff_share::RefreshResult::PathNotFound
    );
}

#[test]
fn test_profile_visibility_of_second_profile() {
    let mut disk = FakeDisk::default();
    disk.dir("/home/a/");
    disk.add_file("/home/a/", "x.bin", 5);
    let mut hasher = FakeHasher::default();
    hasher.hashes.insert("/home/a/x.bin".into(), T1);

    let index = ShareIndex::with_lister(
        settings(),
        Cid([7; 24]),
        Arc::new(hasher),
        Arc::new(NullQueue),
        Arc::new(disk),
    );
    index
        .load_profiles(
            r#"<Shares>
                <Share Token="0" Name="Default">
                    <Directory Virtual="a">/home/a/</Directory>
                </Share>
                <ShareProfile Token="11" Name="Friends"/>
            </Shares>"#,
        )
        .unwrap();
    index.refresh_startup();

    assert_eq!(index.total_share_size(PROFILE_DEFAULT), 5);
    // The friends profile has no roots.
    assert_eq!(index.total_share_size(ProfileId(11)), 0);
    assert!(index.profiles().iter().any(|(id, name)| *id == ProfileId(11) && name == "Friends"));
}
