//! End-to-end scenarios over real pool files: build, mutate, close, reopen.

use crab_vmem::{
    ContainerState, List, Map, MapState, Pool, PoolConfig, PoolError, TypedPtr, MIN_MAPPED_PAGES,
    PAGE_POS_START, PAGE_SIZE,
};
use rand::{seq::SliceRandom, SeedableRng};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_pool(path: &std::path::Path) -> Pool {
    Pool::new(PoolConfig::new(path)).unwrap()
}

fn file_pages(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).unwrap().len() / PAGE_SIZE as u64
}

/// Clients keep their top-level state at offset 0 of the start page.
fn start_state<T: bytemuck::Pod>(pool: &Pool) -> TypedPtr<'_, T> {
    TypedPtr::new(pool, PAGE_POS_START, 0).unwrap()
}

#[test]
fn s1_list_fifo() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.vmem");

    let pool = open_pool(&path);
    let mut state = start_state::<ContainerState>(&pool);
    let mut list = List::<u32>::new(state.as_mut(), &pool);

    for i in 1..=1000u32 {
        list.push_back(i).unwrap();
    }
    assert_eq!(list.len(), 1000);

    let mut popped = Vec::new();
    while let Some(v) = list.pop_front().unwrap() {
        popped.push(v);
    }
    assert_eq!(popped, (1..=1000).collect::<Vec<_>>());
    assert_eq!(list.len(), 0);
    assert!(list.is_empty());

    // Root, start, and the list's former pages (now on the free list).
    drop(list);
    drop(state);
    drop(pool);
    assert_eq!(file_pages(&path), 3);
}

#[test]
fn s2_freed_pages_are_kept() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.vmem");

    let pages_after_pushes;
    {
        let pool = open_pool(&path);
        let mut state = start_state::<ContainerState>(&pool);
        let mut list = List::<u32>::new(state.as_mut(), &pool);

        for i in 1..=10_000u32 {
            list.push_back(i).unwrap();
        }
        pages_after_pushes = file_pages(&path);

        while list.pop_back().unwrap().is_some() {}
        assert_eq!(list.iter().count(), 0);
    }

    // Freed pages are retained, never truncated.
    let pool = open_pool(&path);
    let mut state = start_state::<ContainerState>(&pool);
    let list = List::<u32>::new(state.as_mut(), &pool);
    assert_eq!(list.iter().count(), 0);
    drop(list);
    drop(state);
    drop(pool);
    assert_eq!(file_pages(&path), pages_after_pushes);
}

#[test]
fn s3_s4_map_insert_idempotence_then_erase_shrink() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3.vmem");

    let mut keys: Vec<u64> = (1..=5000).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    keys.shuffle(&mut rng);

    let pool = open_pool(&path);
    let mut state = start_state::<MapState>(&pool);
    let mut map = Map::<u64, u64>::new(state.as_mut(), &pool);

    // S3: first insert succeeds for every key...
    for &k in &keys {
        let (_, inserted) = map.insert(k, k * k).unwrap();
        assert!(inserted, "first insert of {k} was rejected");
    }
    // ...the second one is rejected for every key.
    for &k in &keys {
        let (_, inserted) = map.insert(k, 0).unwrap();
        assert!(!inserted, "duplicate insert of {k} was accepted");
    }
    assert_eq!(map.len(), 5000);
    for &k in &keys {
        assert_eq!(map.get(&k).unwrap(), Some(k * k), "lookup of {k}");
    }

    // Iteration yields the pairs sorted ascending by key.
    let iterated: Vec<(u64, u64)> = map
        .iter()
        .map(|item| item.map(|v| (v.key, v.value)))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(iterated.len(), 5000);
    for (i, &(k, v)) in iterated.iter().enumerate() {
        assert_eq!(k, i as u64 + 1);
        assert_eq!(v, k * k);
    }
    assert!(map.depth() >= 1);

    // S4: erase everything in descending order.
    let pages_full = file_pages(&path);
    for k in (1..=5000u64).rev() {
        assert!(map.remove(&k).unwrap(), "erase of {k} failed");
    }
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.depth(), 0, "key stack must be empty");
    assert_eq!(map.iter().count(), 0);

    // Only root, start, and freed pages remain: rebuilding reuses them
    // without growing the file.
    assert_eq!(file_pages(&path), pages_full);
    for k in 1..=500u64 {
        assert!(map.insert(k, k).unwrap().1);
    }
    assert_eq!(file_pages(&path), pages_full);
}

#[test]
fn s5_capacity_pressure() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s5.vmem");

    {
        let mut config = PoolConfig::new(&path);
        config.max_mapped_pages = MIN_MAPPED_PAGES;
        let pool = Pool::new(config).unwrap();
        let mut state = start_state::<ContainerState>(&pool);
        let mut list = List::<u32>::new(state.as_mut(), &pool);

        for i in 1..=10_000u32 {
            list.push_back(i).unwrap();
        }
        assert_eq!(list.len(), 10_000);
        assert!(pool.stats().reclaim_count > 0, "eviction never ran");
    }

    let mut config = PoolConfig::new(&path);
    config.max_mapped_pages = MIN_MAPPED_PAGES;
    let pool = Pool::new(config).unwrap();
    let mut state = start_state::<ContainerState>(&pool);
    let list = List::<u32>::new(state.as_mut(), &pool);
    let items: Vec<u32> = list.iter().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(items, (1..=10_000).collect::<Vec<_>>());
}

#[test]
fn s6_corruption_is_rejected_without_modification() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s6.vmem");
    drop(open_pool(&path));

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[2] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let err = Pool::new(PoolConfig::new(&path)).err().unwrap();
    assert!(matches!(err, PoolError::Verify(_)), "got {err:?}");

    let after = std::fs::read(&path).unwrap();
    assert_eq!(bytes, after, "a failed open modified the file");
}

#[test]
fn list_roundtrips_across_reopen() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.vmem");

    let expected: Vec<u64> = {
        let pool = open_pool(&path);
        let mut state = start_state::<ContainerState>(&pool);
        let mut list = List::<u64>::new(state.as_mut(), &pool);

        // Mixed front/back inserts and scattered erases.
        for i in 0..4000u64 {
            if i % 3 == 0 {
                list.push_front(i).unwrap();
            } else {
                list.push_back(i).unwrap();
            }
        }
        for _ in 0..500 {
            list.pop_front().unwrap();
            list.pop_back().unwrap();
        }
        list.iter().collect::<Result<Vec<_>, _>>().unwrap()
    };

    let pool = open_pool(&path);
    let mut state = start_state::<ContainerState>(&pool);
    let list = List::<u64>::new(state.as_mut(), &pool);
    let reopened: Vec<u64> = list.iter().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(reopened, expected);
    assert_eq!(list.len(), expected.len() as u64);
}

#[test]
fn map_survives_reopen() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("map-reopen.vmem");

    {
        let pool = open_pool(&path);
        let mut state = start_state::<MapState>(&pool);
        let mut map = Map::<u64, u64>::new(state.as_mut(), &pool);
        for k in 0..2000u64 {
            map.insert(k, !k).unwrap();
        }
    }

    let pool = open_pool(&path);
    let mut state = start_state::<MapState>(&pool);
    let map = Map::<u64, u64>::new(state.as_mut(), &pool);
    assert_eq!(map.len(), 2000);
    for k in 0..2000u64 {
        assert_eq!(map.get(&k).unwrap(), Some(!k));
    }
}

#[test]
fn map_grows_two_inner_levels() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deep.vmem");

    let pool = open_pool(&path);
    let mut state = start_state::<MapState>(&pool);
    let mut map = Map::<u64, u64>::new(state.as_mut(), &pool);

    // Enough ascending inserts to overflow the first key level: end-of-page
    // splits leave leaves half full, so the leaf count passes the key page
    // capacity well before this bound.
    let n = (Map::<u64, u64>::key_page_capacity() as u64 + 8)
        * (Map::<u64, u64>::value_page_capacity() as u64 / 2);
    for k in 0..n {
        assert!(map.insert(k, k).unwrap().1);
    }
    assert!(
        map.depth() >= 2,
        "expected two inner levels, got {}",
        map.depth()
    );
    assert_eq!(map.len(), n);

    // Spot checks across the whole range.
    for k in (0..n).step_by(997) {
        assert_eq!(map.get(&k).unwrap(), Some(k));
    }
    assert_eq!(map.get(&n).unwrap(), None);

    for k in (0..n).rev() {
        assert!(map.remove(&k).unwrap(), "erase of {k} failed");
    }
    assert!(map.is_empty());
    assert_eq!(map.depth(), 0);
}
