use divan::{black_box, Bencher};
use ndarray::Array2;

fn main() {
    divan::main();
}

#[divan::bench(sample_count = 1000)]
fn sift_descriptor(bencher: Bencher) {
    let img = Array2::from_shape_fn((200, 200), |(y, x)| {
        let (x, y) = (x as f32, y as f32);
        0.5 + 0.3 * (0.17 * x).sin() * (0.09 * y + 0.4).cos()
    });
    let mut out = [0.0; sift_homography::DESCRIPTOR_SIZE];

    bencher.bench_local(|| {
        black_box(sift_homography::compute_descriptor(
            &img.view(),
            100.,
            100.,
            2.1,
            2.15,
            0.2,
            &mut out,
        ))
    });
}
