use criterion::{criterion_group, criterion_main, Criterion};
use filmdata::indexer::{Indexer, SearchIndex};
use filmdata::models::RawFilmRecord;
use filmdata::tokenizer::tokenize;

const WORDS: &[&str] = &[
    "star", "night", "river", "house", "dark", "return", "city", "love", "king", "last",
    "summer", "ghost", "island", "secret", "blue", "empire", "shadow", "road", "fire", "dream",
];

fn synthetic_corpus(count: usize) -> Vec<RawFilmRecord> {
    (0..count)
        .map(|i| {
            let title = format!(
                "{} {} {}",
                WORDS[i % WORDS.len()],
                WORDS[(i / 7) % WORDS.len()],
                WORDS[(i / 13) % WORDS.len()]
            );
            RawFilmRecord::new(format!("/m/{:06}", i), title)
                .with_release_date(format!("{}-06-01", 1960 + (i % 60)))
                .with_gross_revenue((i % 997) as f64 * 1_000.0)
        })
        .collect()
}

fn setup_index() -> Indexer {
    let indexer = Indexer::new_in_memory().expect("Failed to create index");
    for chunk in synthetic_corpus(20_000).chunks(1_000) {
        indexer.index_batch(chunk).expect("Failed to index corpus");
    }
    indexer
}

fn bench_search(c: &mut Criterion) {
    let indexer = setup_index();

    let queries = vec![
        ("single_char", "s"),
        ("prefix", "sta"),
        ("infix", "hado"),
        ("full_word", "empire"),
        ("two_words", "dark river"),
        ("no_match", "zzzz"),
    ];

    let mut group = c.benchmark_group("search");
    group.sample_size(20);

    for (name, query) in queries {
        group.bench_function(name, |b| {
            b.iter(|| indexer.search(query, 10, 0).unwrap());
        });
    }
    group.finish();
}

fn bench_tokenize(c: &mut Criterion) {
    c.bench_function("tokenize_title", |b| {
        b.iter(|| tokenize("The Good, the Bad and the Ugly"));
    });
}

criterion_group!(benches, bench_search, bench_tokenize);
criterion_main!(benches);
