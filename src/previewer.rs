//! Live preview over the tev IPC protocol (TCP).
//!
//! The renderer publishes partial films into a lock-free slot; a background
//! thread wakes on a timer, takes the latest frame and pushes it to an
//! external tev instance.

// std
use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
// others
use atom::Atom;
use atomic::Ordering;
use byteorder::{LittleEndian, WriteBytesExt};
use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, warn};
// wavert
use crate::sensors::film::FilmSnapshot;
use crate::sensors::tonemap::Tonemap;

const TEV_CREATE_IMAGE: u8 = 4;
const TEV_UPDATE_IMAGE: u8 = 3;

/// One published preview frame.
pub struct PreviewFrame {
    pub sensor_id: String,
    pub snapshot: FilmSnapshot,
    pub fraction_spe_completed: f64,
    pub tonemap: Tonemap,
}

fn write_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn send_packet(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    stream.write_u32::<LittleEndian>(payload.len() as u32 + 4)?;
    stream.write_all(payload)?;
    Ok(())
}

fn send_create(stream: &mut TcpStream, name: &str, w: u32, h: u32) -> io::Result<()> {
    let mut p = Vec::new();
    p.push(TEV_CREATE_IMAGE);
    p.push(1); // grab focus
    write_cstr(&mut p, name);
    p.write_i32::<LittleEndian>(w as i32)?;
    p.write_i32::<LittleEndian>(h as i32)?;
    p.write_i32::<LittleEndian>(3)?;
    for c in &["R", "G", "B"] {
        write_cstr(&mut p, c);
    }
    send_packet(stream, &p)
}

fn send_update(stream: &mut TcpStream, frame: &PreviewFrame) -> io::Result<()> {
    let snap = &frame.snapshot;
    let (w, h) = (snap.width, snap.height);
    // tone-mapped RGB planes, one update packet per channel
    let mut planes: [Vec<f32>; 3] = [
        Vec::with_capacity((w * h) as usize),
        Vec::with_capacity((w * h) as usize),
        Vec::with_capacity((w * h) as usize),
    ];
    for y in 0..h {
        for x in 0..w {
            let rgb = frame.tonemap.map_pixel(snap.pixel(x, y));
            for (plane, v) in planes.iter_mut().zip(rgb.iter()) {
                plane.push(*v);
            }
        }
    }
    for (plane, name) in planes.iter().zip(&["R", "G", "B"]) {
        let mut p = Vec::with_capacity(plane.len() * 4 + 64);
        p.push(TEV_UPDATE_IMAGE);
        p.push(0); // no focus grab
        write_cstr(&mut p, &frame.sensor_id);
        write_cstr(&mut p, name);
        p.write_i32::<LittleEndian>(0)?;
        p.write_i32::<LittleEndian>(0)?;
        p.write_i32::<LittleEndian>(w as i32)?;
        p.write_i32::<LittleEndian>(h as i32)?;
        for v in plane {
            p.write_f32::<LittleEndian>(*v)?;
        }
        send_packet(stream, &p)?;
    }
    Ok(())
}

/// Pushes partial films to an external tev previewer.
pub struct Previewer {
    slot: Arc<Atom<Box<PreviewFrame>>>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Previewer {
    /// Connects to a tev instance and starts the sender thread, waking
    /// every `interval` to push the latest published frame.
    pub fn connect(host: &str, port: u16, interval: Duration) -> io::Result<Previewer> {
        let mut stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true).ok();

        let slot: Arc<Atom<Box<PreviewFrame>>> = Arc::new(Atom::empty());
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_slot = slot.clone();
        let ticker = tick(interval);

        let handle = std::thread::spawn(move || {
            let mut created: Vec<(String, u32, u32)> = Vec::new();
            loop {
                // sleep between preview intervals; stop wakes us early
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {}
                }
                if let Some(frame) = thread_slot.take(Ordering::SeqCst) {
                    let key = (
                        frame.sensor_id.clone(),
                        frame.snapshot.width,
                        frame.snapshot.height,
                    );
                    if !created.contains(&key) {
                        if let Err(e) =
                            send_create(&mut stream, &key.0, key.1, key.2)
                        {
                            warn!("tev create failed: {}", e);
                            break;
                        }
                        created.push(key);
                    }
                    debug!(
                        sensor = frame.sensor_id.as_str(),
                        fraction = frame.fraction_spe_completed,
                        "preview update"
                    );
                    if let Err(e) = send_update(&mut stream, &frame) {
                        warn!("tev update failed: {}", e);
                        break;
                    }
                }
            }
            // flush the final frame on shutdown
            if let Some(frame) = thread_slot.take(Ordering::SeqCst) {
                let _ = send_update(&mut stream, &frame);
            }
        });

        Ok(Previewer {
            slot,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Publishes a partial film; the latest unsent frame wins.
    pub fn update(
        &self,
        sensor_id: &str,
        partial_film: FilmSnapshot,
        fraction_spe_completed: f64,
        tonemap: Tonemap,
    ) {
        self.slot.swap(
            Box::new(PreviewFrame {
                sensor_id: sensor_id.to_string(),
                snapshot: partial_film,
                fraction_spe_completed,
                tonemap,
            }),
            Ordering::SeqCst,
        );
    }

    pub fn shutdown(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Previewer {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::film::Film;
    use crate::sensors::response::Response;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn publishes_frames_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            // read until the client hangs up
            let _ = conn.read_to_end(&mut buf);
            buf
        });

        let previewer =
            Previewer::connect("127.0.0.1", port, Duration::from_millis(20)).unwrap();
        let film = Film::new(4, 4, Response::Scalar, false);
        film.splat(
            1,
            1,
            &crate::interaction::polarimetric::Stokes::unpolarized(1.0),
            [1.0, 0.0, 0.0],
        );
        film.add_sample_weight(1, 1, 1.0);
        previewer.update("cam", film.snapshot(), 0.5, Tonemap::default_for_channels(1));
        std::thread::sleep(Duration::from_millis(80));
        previewer.shutdown();

        let bytes = server.join().unwrap();
        // a create packet and three channel updates were sent
        assert!(bytes.len() > 16);
        assert!(bytes.windows(4).any(|w| w == b"cam\0"));
    }
}
